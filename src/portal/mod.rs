pub mod flow;
pub mod http_session;
pub mod markers;
pub mod scripted;

pub use flow::{BookingFlow, FlowOutcome, FlowTiming, FlowVariant, InteractionSequence};
pub use http_session::{HttpSession, HttpSessionFactory, StepSelectors};
pub use markers::{Marker, MarkerTable};
pub use scripted::{ScriptedFactory, ScriptedSession};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::config::Address;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortalError {
    /// The portal showed something the flow understands but cannot proceed
    /// with. The message is what the classifier inspects.
    #[error("{0}")]
    Domain(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Unsupported step: {0}")]
    Unsupported(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session closed")]
    SessionClosed,
}

impl PortalError {
    pub fn domain(message: impl Into<String>) -> Self {
        PortalError::Domain(message.into())
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, PortalError::Domain(_))
    }
}

impl From<reqwest::Error> for PortalError {
    fn from(err: reqwest::Error) -> Self {
        PortalError::Transport(err.to_string())
    }
}

pub type PortalResult<T> = Result<T, PortalError>;

/// Coarse view of the page after a navigation or step.
#[derive(Debug, Clone, PartialEq)]
pub struct PageObservation {
    pub title: String,
    pub url: Url,
    pub body_text: String,
}

impl PageObservation {
    pub fn new(url: Url, title: impl Into<String>, body_text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url,
            body_text: body_text.into(),
        }
    }
}

/// One page action. The port decides how each one maps onto the live page.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Re-read the current page, used while waiting on interstitials.
    Poll,
    DismissCookieBanner,
    SearchAppointments,
    DeclineClaim,
    SelectEligibleGroup,
    EnterAge(u32),
    SubmitAge,
    Book(Box<Address>),
}

impl Step {
    pub fn id(&self) -> &'static str {
        match self {
            Step::Poll => "poll",
            Step::DismissCookieBanner => "dismiss_cookie_banner",
            Step::SearchAppointments => "search_appointments",
            Step::DeclineClaim => "decline_claim",
            Step::SelectEligibleGroup => "select_eligible_group",
            Step::EnterAge(_) => "enter_age",
            Step::SubmitAge => "submit_age",
            Step::Book(_) => "book",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsoleLevel {
    Info,
    Warning,
    Severe,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ConsoleEntry {
    pub fn new(level: ConsoleLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn severe(message: impl Into<String>) -> Self {
        Self::new(ConsoleLevel::Severe, message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    #[serde(skip)]
    pub page_source: String,
    pub console: Vec<ConsoleEntry>,
    pub cookies: Vec<String>,
}

impl Diagnostics {
    pub fn last_severe(&self) -> Option<&str> {
        self.console
            .iter()
            .rev()
            .find(|entry| entry.level == ConsoleLevel::Severe)
            .map(|entry| entry.message.as_str())
    }
}

/// A live browsing context on the portal. Exactly one exists at a time and
/// it is never shared between tasks.
#[async_trait]
pub trait PageInteraction: Send {
    async fn navigate(&mut self, url: &Url) -> PortalResult<PageObservation>;
    async fn perform_step(&mut self, step: &Step) -> PortalResult<PageObservation>;

    /// Snapshot of everything useful for a post-mortem. Drains the console
    /// buffer, so consecutive calls only see new entries.
    async fn capture_diagnostics(&mut self) -> Diagnostics;

    async fn close(&mut self) -> PortalResult<()>;
    fn describe(&self) -> String;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> PortalResult<Box<dyn PageInteraction>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_severe_picks_latest_severe_entry() {
        let diagnostics = Diagnostics {
            console: vec![
                ConsoleEntry::severe("first failure"),
                ConsoleEntry::new(ConsoleLevel::Info, "loaded"),
                ConsoleEntry::severe("https://portal.test/rest - status of 429 ()"),
                ConsoleEntry::new(ConsoleLevel::Warning, "deprecated api"),
            ],
            ..Default::default()
        };

        assert_eq!(
            diagnostics.last_severe(),
            Some("https://portal.test/rest - status of 429 ()")
        );
    }

    #[test]
    fn test_last_severe_none_without_severe_entries() {
        let diagnostics = Diagnostics {
            console: vec![ConsoleEntry::new(ConsoleLevel::Info, "ok")],
            ..Default::default()
        };
        assert_eq!(diagnostics.last_severe(), None);
    }
}
