use log::debug;
use regex::Regex;
use serde::Serialize;
use std::fmt;

use crate::portal::PortalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    MaintenanceMode,
    ChallengeTimeout,
    AlreadyScheduled,
    UnexpectedPageState,
    RateLimited,
    Unclassified,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MaintenanceMode => "maintenance mode",
            ErrorKind::ChallengeTimeout => "challenge timeout",
            ErrorKind::AlreadyScheduled => "already scheduled",
            ErrorKind::UnexpectedPageState => "unexpected page state",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub detail: String,
    /// Last severe console line seen right after the failure.
    pub diagnostic: Option<String>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            diagnostic: None,
        }
    }

    pub fn is_already_scheduled(&self) -> bool {
        self.kind == ErrorKind::AlreadyScheduled
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)?;
        if let Some(diagnostic) = &self.diagnostic {
            write!(f, " (console: {diagnostic})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalChannel {
    /// The failure's own message; only domain failures carry one worth reading.
    Failure,
    /// The last severe browser console line.
    Diagnostic,
}

#[derive(Debug, Clone)]
pub struct SignalRule {
    pub channel: SignalChannel,
    pub pattern: String,
    pub is_regex: bool,
    pub kind: ErrorKind,
}

impl SignalRule {
    pub fn text(channel: SignalChannel, pattern: &str, kind: ErrorKind) -> Self {
        Self {
            channel,
            pattern: pattern.to_string(),
            is_regex: false,
            kind,
        }
    }

    pub fn regex(channel: SignalChannel, pattern: &str, kind: ErrorKind) -> Self {
        Self {
            channel,
            pattern: pattern.to_string(),
            is_regex: true,
            kind,
        }
    }

    fn matches(&self, haystack: &str) -> bool {
        if self.is_regex {
            Regex::new(&self.pattern)
                .map(|re| re.is_match(haystack))
                .unwrap_or(false)
        } else {
            haystack
                .to_lowercase()
                .contains(&self.pattern.to_lowercase())
        }
    }
}

/// Maps a failed interaction onto an [`ErrorKind`] by looking at text
/// signals. Rules are tried in order; the first match wins.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<SignalRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        use ErrorKind::*;
        use SignalChannel::*;

        Self {
            rules: vec![
                SignalRule::text(Failure, "already scheduled", AlreadyScheduled),
                SignalRule::regex(Diagnostic, r"\b429\b", RateLimited),
                SignalRule::text(Failure, "maintenance", MaintenanceMode),
                SignalRule::text(Failure, "timeout in the", ChallengeTimeout),
                SignalRule::regex(
                    Failure,
                    r"(?i)was expecting to see|unable to access",
                    UnexpectedPageState,
                ),
            ],
        }
    }
}

impl ErrorClassifier {
    pub fn with_rule(mut self, rule: SignalRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn classify(&self, failure: &PortalError, last_severe: Option<&str>) -> ClassifiedError {
        let message = failure.to_string();

        let matched = self.rules.iter().find(|rule| match rule.channel {
            SignalChannel::Failure => failure.is_domain() && rule.matches(&message),
            SignalChannel::Diagnostic => last_severe.is_some_and(|line| rule.matches(line)),
        });

        let kind = match matched {
            Some(rule) => rule.kind,
            None if failure.is_domain() => ErrorKind::UnexpectedPageState,
            None => ErrorKind::Unclassified,
        };
        debug!("Classified failure '{}' as {:?}", message, kind);

        ClassifiedError {
            kind,
            detail: message,
            diagnostic: last_severe.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(failure: PortalError, console: Option<&str>) -> ErrorKind {
        ErrorClassifier::default().classify(&failure, console).kind
    }

    #[test]
    fn test_domain_messages_map_to_kinds() {
        assert_eq!(
            classify(PortalError::domain("site is currently in maintenance mode"), None),
            ErrorKind::MaintenanceMode
        );
        assert_eq!(
            classify(
                PortalError::domain(
                    "Timeout in the \"Challenge Validation\" step has occurred (timeout=60s)"
                ),
                None
            ),
            ErrorKind::ChallengeTimeout
        );
        assert_eq!(
            classify(PortalError::domain("appointment already scheduled"), None),
            ErrorKind::AlreadyScheduled
        );
        assert_eq!(
            classify(
                PortalError::domain(
                    "was expecting to see \"Termine suchen\" but this string was not found"
                ),
                None
            ),
            ErrorKind::UnexpectedPageState
        );
        assert_eq!(
            classify(
                PortalError::domain("Unable to access the page x, being redirected to y"),
                None
            ),
            ErrorKind::UnexpectedPageState
        );
    }

    #[test]
    fn test_rate_limit_comes_from_diagnostic_channel() {
        let console = "https://portal.test/rest/suche - Failed to load resource: the server responded with a status of 429 ()";
        assert_eq!(
            classify(
                PortalError::domain("was expecting to see \"Termine suchen\""),
                Some(console)
            ),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(PortalError::Transport("connection reset".into()), Some(console)),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn test_429_inside_longer_number_is_not_rate_limit() {
        assert_eq!(
            classify(
                PortalError::domain("was expecting to see \"Termine suchen\""),
                Some("request id 142903 failed")
            ),
            ErrorKind::UnexpectedPageState
        );
    }

    #[test]
    fn test_already_scheduled_wins_over_rate_limit() {
        assert_eq!(
            classify(
                PortalError::domain("appointment already scheduled"),
                Some("status of 429 ()")
            ),
            ErrorKind::AlreadyScheduled
        );
    }

    #[test]
    fn test_failure_rules_ignore_non_domain_failures() {
        assert_eq!(
            classify(PortalError::ElementNotFound("maintenance banner".into()), None),
            ErrorKind::Unclassified
        );
        assert_eq!(
            classify(PortalError::Transport("dns error".into()), None),
            ErrorKind::Unclassified
        );
    }

    #[test]
    fn test_unknown_domain_failure_is_unexpected_page_state() {
        assert_eq!(
            classify(PortalError::domain("something odd on the page"), None),
            ErrorKind::UnexpectedPageState
        );
    }

    #[test]
    fn test_classified_error_keeps_detail_and_diagnostic() {
        let classified = ErrorClassifier::default().classify(
            &PortalError::domain("appointment already scheduled"),
            Some("severe line"),
        );
        assert!(classified.is_already_scheduled());
        assert_eq!(classified.detail, "appointment already scheduled");
        assert_eq!(classified.diagnostic.as_deref(), Some("severe line"));
    }

    #[test]
    fn test_custom_rule_appended() {
        let classifier = ErrorClassifier::default().with_rule(SignalRule::text(
            SignalChannel::Diagnostic,
            "net::ERR_TIMED_OUT",
            ErrorKind::ChallengeTimeout,
        ));
        let classified = classifier.classify(
            &PortalError::Transport("timed out".into()),
            Some("GET https://portal.test net::ERR_TIMED_OUT"),
        );
        assert_eq!(classified.kind, ErrorKind::ChallengeTimeout);
    }
}
