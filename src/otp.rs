//! OTP extraction from SMS bodies.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Safe default: any standalone run of 4–8 digits.
static FALLBACK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4,8})\b").expect("OTP fallback pattern"));

/// Pulls one-time passwords out of message text with a configured pattern,
/// degrading to the digit-run fallback instead of ever failing.
pub struct OtpExtractor {
    primary: Option<Regex>,
}

impl OtpExtractor {
    /// Compile the configured pattern. A pattern that does not compile is
    /// logged and disabled; extraction then relies on the fallback alone.
    pub fn new(pattern: &str) -> Self {
        let primary = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("OTP_REGEX {pattern:?} does not compile, using fallback: {e}");
                None
            }
        };
        Self { primary }
    }

    /// The OTP in `text`, if any. Capture group 1 of the configured pattern
    /// wins; when it yields nothing the fallback digit-run pattern is tried.
    pub fn extract(&self, text: &str) -> Option<String> {
        if let Some(re) = &self.primary {
            if let Some(m) = re.captures(text).and_then(|caps| caps.get(1)) {
                return Some(m.as_str().to_string());
            }
        }
        FALLBACK_RE
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_pattern_wins() {
        let ex = OtpExtractor::new(r"OTP: (\d{6})");
        assert_eq!(
            ex.extract("Ma OTP: 482913 co hieu luc 2p.").as_deref(),
            Some("482913")
        );
    }

    #[test]
    fn fallback_on_uncompilable_pattern() {
        let ex = OtpExtractor::new(r"(unclosed");
        assert_eq!(ex.extract("code 4829 here").as_deref(), Some("4829"));
    }

    #[test]
    fn fallback_when_pattern_does_not_match() {
        let ex = OtpExtractor::new(r"OTP la (\d{6})");
        assert_eq!(ex.extract("ma xac thuc 55667788").as_deref(), Some("55667788"));
    }

    #[test]
    fn none_when_no_digit_run() {
        let ex = OtpExtractor::new(r"\b(\d{4,8})\b");
        assert_eq!(ex.extract("Thank you for your purchase."), None);
        // three digits is below the fallback floor, nine above its ceiling
        assert_eq!(ex.extract("call 911"), None);
        assert_eq!(ex.extract("ref 123456789"), None);
    }

    #[test]
    fn extracted_value_is_a_matching_substring() {
        let ex = OtpExtractor::new(r"\b(\d{4,8})\b");
        let text = "Ma 482913 co hieu luc";
        let otp = ex.extract(text).unwrap();
        assert!(text.contains(&otp));
        assert!(Regex::new(r"\b(\d{4,8})\b").unwrap().is_match(&otp));
    }
}
