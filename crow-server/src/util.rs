//! Small text helpers.

use std::sync::OnceLock;

/// Strip every punctuation and symbol character, Unicode-aware.
///
/// Exit phrases are matched against user text after this normalization, so
/// "再见。" and "再见" compare equal.
#[must_use]
pub fn remove_all_punctuation(text: &str) -> String {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"[\p{P}\p{S}]+").expect("valid regex"));
    re.replace_all(text, "").into_owned()
}
