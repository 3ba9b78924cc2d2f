use regex::Regex;
use std::sync::LazyLock;

pub const DEFAULT_SUCCESS_PATTERN: &str = "Build completed successfully!";

// CSI sequences (colors, cursor moves) and OSC titles.
static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap()
});

static DEFAULT_SUCCESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&regex::escape(DEFAULT_SUCCESS_PATTERN)).unwrap());

/// Terminal verdict announced by a sentinel line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure { line: String },
}

/// Recognizes success/failure sentinel lines in build output.
#[derive(Debug, Clone)]
pub struct CompletionMatcher {
    success: Vec<Regex>,
    failure: Vec<Regex>,
}

impl Default for CompletionMatcher {
    fn default() -> Self {
        Self {
            success: vec![DEFAULT_SUCCESS_REGEX.clone()],
            failure: Vec::new(),
        }
    }
}

impl CompletionMatcher {
    pub fn new(success: Vec<Regex>, failure: Vec<Regex>) -> Self {
        Self { success, failure }
    }

    /// Compile pattern strings. An empty success list keeps the default
    /// sentinel; an empty failure list means no failure sentinel.
    pub fn from_patterns<S: AsRef<str>>(success: &[S], failure: &[S]) -> Result<Self, regex::Error> {
        let compile = |patterns: &[S]| -> Result<Vec<Regex>, regex::Error> {
            patterns.iter().map(|p| Regex::new(p.as_ref())).collect()
        };
        let mut success = compile(success)?;
        if success.is_empty() {
            success.push(DEFAULT_SUCCESS_REGEX.clone());
        }
        Ok(Self {
            success,
            failure: compile(failure)?,
        })
    }

    /// Failure patterns are checked first so a line matching both fails.
    pub fn detect(&self, line: &str) -> Option<Completion> {
        let plain = strip_ansi(line);
        if self.failure.iter().any(|re| re.is_match(&plain)) {
            return Some(Completion::Failure {
                line: plain.trim().to_string(),
            });
        }
        if self.success.iter().any(|re| re.is_match(&plain)) {
            return Some(Completion::Success);
        }
        None
    }
}

pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI_REGEX.replace_all(line, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_colored_sentinel() {
        let matcher = CompletionMatcher::default();
        assert_eq!(
            matcher.detect("\x1b[1;32m✓ Build completed successfully!\x1b[0m"),
            Some(Completion::Success)
        );
        assert_eq!(matcher.detect("===> EXPORTING"), None);
    }

    #[test]
    fn default_pattern_is_literal() {
        let matcher = CompletionMatcher::default();
        assert_eq!(matcher.detect("Build completed successfully"), None);
    }

    #[test]
    fn failure_wins_over_success() {
        let matcher =
            CompletionMatcher::from_patterns(&["done"], &[r"^ERROR:", r"done with errors"]).unwrap();
        assert_eq!(
            matcher.detect("done with errors"),
            Some(Completion::Failure {
                line: "done with errors".into()
            })
        );
        assert_eq!(matcher.detect("done"), Some(Completion::Success));
        assert!(matches!(
            matcher.detect("\x1b[31mERROR: failed to build\x1b[0m"),
            Some(Completion::Failure { line }) if line == "ERROR: failed to build"
        ));
    }

    #[test]
    fn empty_success_list_keeps_default() {
        let matcher = CompletionMatcher::from_patterns::<&str>(&[], &[]).unwrap();
        assert_eq!(matcher.detect("Build completed successfully!"), Some(Completion::Success));
    }

    #[test]
    fn invalid_pattern_is_error() {
        assert!(CompletionMatcher::from_patterns(&["(unclosed"], &[]).is_err());
    }

    #[test]
    fn strips_osc_and_csi() {
        assert_eq!(strip_ansi("\x1b]0;title\x07hello \x1b[2Kworld"), "hello world");
    }
}
