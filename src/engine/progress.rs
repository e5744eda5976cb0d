//! Progress extraction from the upscaler's text output.
//!
//! The tool's only output protocol is a `<digits>%` token somewhere in a line
//! plus a case-insensitive `done` substring near the end of a run. Anything
//! else is noise and is passed through to the UI log untouched.

use regex::Regex;

pub(crate) struct ProgressParser {
    percent_re: Regex,
}

impl ProgressParser {
    pub(crate) fn new() -> Self {
        Self {
            // Pattern is a constant; compilation cannot fail.
            percent_re: Regex::new(r"(\d+)%").expect("valid percent pattern"),
        }
    }

    /// Extract a percentage from a line, clamped to 100.
    ///
    /// The tool only ever prints 0-100, but the pattern itself does not
    /// enforce that, so out-of-range and overlong digit runs clamp.
    pub(crate) fn percent(&self, line: &str) -> Option<u8> {
        let digits = self.percent_re.captures(line)?.get(1)?.as_str();
        Some(digits.parse::<u64>().map_or(100, |v| v.min(100)) as u8)
    }

    /// A `done` substring anywhere in a line, in any case, means the tool is
    /// finished regardless of the last printed percentage. Kept literally from
    /// the tool's observed output grammar, false positives and all.
    pub(crate) fn is_done(&self, line: &str) -> bool {
        line.to_ascii_lowercase().contains("done")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_extracted_from_noise() {
        let p = ProgressParser::new();
        assert_eq!(p.percent("writing... 42% done so far"), Some(42));
        assert_eq!(p.percent("75%"), Some(75));
        assert_eq!(p.percent("0%"), Some(0));
    }

    #[test]
    fn lines_without_percent_yield_nothing() {
        let p = ProgressParser::new();
        assert_eq!(p.percent("loading model weights"), None);
        assert_eq!(p.percent("100 percent"), None);
        assert_eq!(p.percent(""), None);
    }

    #[test]
    fn percent_clamps_to_100() {
        let p = ProgressParser::new();
        assert_eq!(p.percent("250%"), Some(100));
        // A digit run too long for u64 still clamps instead of erroring.
        assert_eq!(p.percent("99999999999999999999999999%"), Some(100));
    }

    #[test]
    fn first_percent_wins_on_multiple_matches() {
        let p = ProgressParser::new();
        assert_eq!(p.percent("10% then 20%"), Some(10));
    }

    #[test]
    fn done_is_case_insensitive() {
        let p = ProgressParser::new();
        assert!(p.is_done("done"));
        assert!(p.is_done("Done"));
        assert!(p.is_done("DONE"));
        assert!(p.is_done("writing... 42% done so far"));
        assert!(!p.is_done("processing tile 3/9"));
    }
}
