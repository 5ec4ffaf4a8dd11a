//! The one reading of boolean flags used by the migrator and the verifier.
//!
//! Integers and reals are flags only as 0 or 1. Text is matched against two
//! fixed word sets, case-insensitively and ignoring surrounding whitespace.

/// Words read as `true`.
pub const TRUE_WORDS: &[&str] = &["1", "t", "true", "y", "yes"];

/// Words read as `false`.
pub const FALSE_WORDS: &[&str] = &["0", "f", "false", "n", "no"];

pub fn from_integer(v: i64) -> Option<bool> {
    match v {
        1 => Some(true),
        0 => Some(false),
        _ => None,
    }
}

pub fn from_real(v: f64) -> Option<bool> {
    if v == 1.0 {
        Some(true)
    } else if v == 0.0 {
        Some(false)
    } else {
        None
    }
}

pub fn from_text(s: &str) -> Option<bool> {
    let word = s.trim().to_lowercase();
    if TRUE_WORDS.contains(&word.as_str()) {
        Some(true)
    } else if FALSE_WORDS.contains(&word.as_str()) {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_zero_and_one_are_numeric_flags() {
        assert_eq!(from_integer(1), Some(true));
        assert_eq!(from_integer(0), Some(false));
        assert_eq!(from_integer(2), None);
        assert_eq!(from_integer(-1), None);
        assert_eq!(from_real(1.0), Some(true));
        assert_eq!(from_real(-0.0), Some(false));
        assert_eq!(from_real(0.5), None);
    }

    #[test]
    fn test_words() {
        assert_eq!(from_text(" YES "), Some(true));
        assert_eq!(from_text("t"), Some(true));
        assert_eq!(from_text("No"), Some(false));
        assert_eq!(from_text("on"), None);
        assert_eq!(from_text("off"), None);
        assert_eq!(from_text(""), None);
    }
}
