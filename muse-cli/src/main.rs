mod args;

use std::process::ExitCode;

use anyhow::Result;
use args::{parse_request, Args};
use clap::error::ErrorKind;
use clap::Parser;
use muse_core::{Artifact, Dispatcher, GenerationRequest, HubLoader};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    init_tracing(args.verbose);

    // Arguments are checked before any model is touched.
    let request = match parse_request(&args.inputs) {
        Ok(request) => request,
        Err(err) => {
            if !err.is_silent() {
                error!("{err}");
            }
            return ExitCode::FAILURE;
        }
    };

    match run(&args, &request) {
        Ok(artifact) => {
            println!("{artifact}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// stdout carries only the result, so logs go to stderr.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: &Args, request: &GenerationRequest) -> Result<Artifact> {
    let api = args.hub_api()?;
    let loader = HubLoader::new(api, args.device_map())?;
    let mut dispatcher = Dispatcher::new(loader, args.dispatcher_config());
    Ok(dispatcher.dispatch(request)?)
}
