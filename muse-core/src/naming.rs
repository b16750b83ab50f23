//! Human-readable output names derived from the request text.
//!
//! Names are not unique: two inputs that share a prefix map to the same file,
//! and the later write replaces the earlier one.

/// Number of leading characters of the input that make up a name.
pub const MAX_STEM_CHARS: usize = 20;

/// Characters that are not allowed in a file name on at least one major platform.
pub const UNSAFE_CHARS: [char; 9] = ['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

pub const DEFAULT_IMAGE_STEM: &str = "generated_image";
pub const DEFAULT_AUDIO_STEM: &str = "audio";

/// Takes the first [`MAX_STEM_CHARS`] characters of `text`, drops
/// [`UNSAFE_CHARS`], trims whitespace, and falls back to `fallback` when
/// nothing is left.
pub fn derive_stem(text: &str, fallback: &str) -> String {
    let stem: String = text
        .chars()
        .take(MAX_STEM_CHARS)
        .filter(|c| !UNSAFE_CHARS.contains(c))
        .collect();
    match stem.trim() {
        "" => fallback.to_string(),
        trimmed => trimmed.to_string(),
    }
}
