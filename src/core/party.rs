use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use url::Url;

use super::classifier::{ClassifiedError, ErrorKind};
use crate::config::{PartyConfig, TimingConfig};
use crate::portal::FlowOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScheduleStatus {
    #[serde(rename = "init")]
    Init,
    /// An appointment is booked for this party.
    #[serde(rename = "scheduled")]
    Scheduled,
    /// Slots were detected and the party has been told.
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "no appointment")]
    NoAppointment,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ScheduleStatus::Init => "init",
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::NoAppointment => "no appointment",
            ScheduleStatus::Error => "error",
        };
        f.write_str(value)
    }
}

/// Result of one check cycle for one party.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    SlotFound,
    NoSlot,
    Booked,
    Failed(ClassifiedError),
}

impl CheckOutcome {
    pub fn found_slot(&self) -> bool {
        matches!(self, CheckOutcome::SlotFound | CheckOutcome::Booked)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            CheckOutcome::Failed(error) => Some(error.kind),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            CheckOutcome::SlotFound => "slot_found".to_string(),
            CheckOutcome::NoSlot => "no_slot".to_string(),
            CheckOutcome::Booked => "booked".to_string(),
            CheckOutcome::Failed(error) => format!("{:?}", error.kind),
        }
    }
}

impl From<FlowOutcome> for CheckOutcome {
    fn from(outcome: FlowOutcome) -> Self {
        match outcome {
            FlowOutcome::SlotFound => CheckOutcome::SlotFound,
            FlowOutcome::NoSlot => CheckOutcome::NoSlot,
            FlowOutcome::Booked => CheckOutcome::Booked,
        }
    }
}

/// How long a party is left alone after landing in `pending` or `scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldowns {
    pub pending: Duration,
    pub scheduled: Duration,
}

impl Default for Cooldowns {
    fn default() -> Self {
        Self {
            pending: Duration::minutes(20),
            scheduled: Duration::hours(2),
        }
    }
}

impl From<&TimingConfig> for Cooldowns {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            pending: Duration::minutes(timing.pending_cooldown_mins),
            scheduled: Duration::minutes(timing.scheduled_cooldown_mins),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorState {
    pub status: ScheduleStatus,
    pub last_check_timestamp: Option<DateTime<Utc>>,
    pub last_check_success: Option<bool>,
    pub last_error: Option<ClassifiedError>,
    /// Start of the current uninterrupted run of `error` results.
    pub error_since: Option<DateTime<Utc>>,
    pub error_notification_sent: bool,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            status: ScheduleStatus::Init,
            last_check_timestamp: None,
            last_check_success: None,
            last_error: None,
            error_since: None,
            error_notification_sent: false,
        }
    }
}

/// What a completed cycle changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old: ScheduleStatus,
    pub new: ScheduleStatus,
    pub error_notification_sent_before: bool,
}

impl Transition {
    pub fn left_error(&self) -> bool {
        self.old == ScheduleStatus::Error && self.new != ScheduleStatus::Error
    }
}

#[derive(Debug, Clone)]
pub struct Party {
    pub profile: PartyConfig,
    identifier: String,
    pub state: MonitorState,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("[^a-z]").expect("static pattern"))
}

impl Party {
    pub fn new(profile: PartyConfig) -> Self {
        let identifier = identifier_pattern()
            .replace_all(&profile.name.to_lowercase(), "_")
            .into_owned();

        Self {
            profile,
            identifier,
            state: MonitorState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Lowercased name with everything outside `a-z` turned into `_`.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn status(&self) -> ScheduleStatus {
        self.state.status
    }

    pub fn has_reservation_code(&self) -> bool {
        self.profile.code.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    pub fn search_url(&self) -> Result<Url, url::ParseError> {
        let postal_code = self.profile.postal_code.as_deref().unwrap_or_default();
        match self.profile.code.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(code) => {
                let vaccine_code = self.profile.vaccine_code.as_deref().unwrap_or_default();
                self.profile
                    .url
                    .join(&format!("impftermine/suche/{code}/{postal_code}/{vaccine_code}"))
            }
            None => self
                .profile
                .url
                .join(&format!("impftermine/service?plz={postal_code}")),
        }
    }

    /// Page the portal bounces visitors to when a deep link is refused.
    pub fn landing_url(&self) -> Result<Url, url::ParseError> {
        self.profile.url.join("impftermine")
    }

    pub fn last_check_elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.state.last_check_timestamp.map(|at| now - at)
    }

    pub fn error_streak(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.state.status {
            ScheduleStatus::Error => self.state.error_since.map(|since| now - since),
            _ => None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>, cooldowns: &Cooldowns) -> bool {
        let cooldown = match self.state.status {
            ScheduleStatus::Pending => cooldowns.pending,
            ScheduleStatus::Scheduled => cooldowns.scheduled,
            _ => return true,
        };

        match self.last_check_elapsed(now) {
            Some(elapsed) => elapsed >= cooldown,
            None => true,
        }
    }

    /// Applies the result of a finished cycle. Always stamps the check time.
    pub fn record_outcome(&mut self, outcome: &CheckOutcome, now: DateTime<Utc>) -> Transition {
        let old = self.state.status;
        let error_notification_sent_before = self.state.error_notification_sent;

        let new = match outcome {
            CheckOutcome::SlotFound => {
                self.state.last_check_success = Some(true);
                ScheduleStatus::Pending
            }
            CheckOutcome::NoSlot => {
                self.state.last_check_success = Some(false);
                ScheduleStatus::NoAppointment
            }
            CheckOutcome::Booked => {
                self.state.last_check_success = Some(true);
                ScheduleStatus::Scheduled
            }
            CheckOutcome::Failed(error) if error.is_already_scheduled() => {
                ScheduleStatus::Scheduled
            }
            CheckOutcome::Failed(error) => {
                self.state.last_error = Some(error.clone());
                if old != ScheduleStatus::Error || self.state.error_since.is_none() {
                    self.state.error_since = Some(now);
                }
                ScheduleStatus::Error
            }
        };

        if new != ScheduleStatus::Error {
            self.state.error_since = None;
        }
        self.state.status = new;
        self.state.last_check_timestamp = Some(now);

        Transition {
            old,
            new,
            error_notification_sent_before,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 5, 3, 8, 0, 0).unwrap()
    }

    fn party(code: Option<&str>) -> Party {
        let mut profile = PartyConfig::new(
            "Erika Müller-2",
            "erika@example.org",
            Url::parse("https://001-iz.portal.test/").unwrap(),
        )
        .with_postal_code("70173")
        .with_age(62);
        profile.code = code.map(str::to_string);
        Party::new(profile)
    }

    fn failure(kind: ErrorKind) -> CheckOutcome {
        CheckOutcome::Failed(ClassifiedError::new(kind, "boom"))
    }

    #[test]
    fn test_identifier_normalizes_name() {
        assert_eq!(party(None).identifier(), "erika_m_ller__");
    }

    #[test]
    fn test_vaccine_code_narrows_reservation_search() {
        let mut p = party(Some("ABCD-1234"));
        p.profile.vaccine_code = Some("L920".to_string());
        assert_eq!(
            p.search_url().unwrap().as_str(),
            "https://001-iz.portal.test/impftermine/suche/ABCD-1234/70173/L920"
        );

        let mut waitlist = party(None);
        waitlist.profile.vaccine_code = Some("L920".to_string());
        assert_eq!(
            waitlist.search_url().unwrap().as_str(),
            "https://001-iz.portal.test/impftermine/service?plz=70173"
        );
    }

    #[test]
    fn test_search_urls() {
        assert_eq!(
            party(Some("ABCD-1234")).search_url().unwrap().as_str(),
            "https://001-iz.portal.test/impftermine/suche/ABCD-1234/70173/"
        );
        assert_eq!(
            party(None).search_url().unwrap().as_str(),
            "https://001-iz.portal.test/impftermine/service?plz=70173"
        );
        assert_eq!(
            party(None).landing_url().unwrap().as_str(),
            "https://001-iz.portal.test/impftermine"
        );
    }

    #[test]
    fn test_new_party_is_due() {
        let p = party(None);
        assert_eq!(p.status(), ScheduleStatus::Init);
        assert!(p.is_due(t0(), &Cooldowns::default()));
    }

    #[test]
    fn test_pending_cooldown_boundary() {
        let mut p = party(None);
        p.record_outcome(&CheckOutcome::SlotFound, t0());
        let cooldowns = Cooldowns::default();

        for minutes in [0, 1, 10, 19] {
            assert!(!p.is_due(t0() + Duration::minutes(minutes), &cooldowns));
        }
        assert!(!p.is_due(t0() + Duration::minutes(20) - Duration::seconds(1), &cooldowns));
        assert!(p.is_due(t0() + Duration::minutes(20), &cooldowns));
        assert!(p.is_due(t0() + Duration::minutes(45), &cooldowns));
    }

    #[test]
    fn test_scheduled_cooldown_boundary() {
        let mut p = party(Some("ABCD"));
        p.record_outcome(&failure(ErrorKind::AlreadyScheduled), t0());
        let cooldowns = Cooldowns::default();

        assert!(!p.is_due(t0() + Duration::minutes(119), &cooldowns));
        assert!(p.is_due(t0() + Duration::hours(2), &cooldowns));
    }

    #[test]
    fn test_other_states_always_due() {
        let cooldowns = Cooldowns::default();
        let mut p = party(None);

        p.record_outcome(&CheckOutcome::NoSlot, t0());
        assert!(p.is_due(t0(), &cooldowns));

        p.record_outcome(&failure(ErrorKind::MaintenanceMode), t0());
        assert!(p.is_due(t0(), &cooldowns));
    }

    #[test]
    fn test_slot_found_transition() {
        let mut p = party(None);
        let transition = p.record_outcome(&CheckOutcome::SlotFound, t0());

        assert_eq!(transition.old, ScheduleStatus::Init);
        assert_eq!(transition.new, ScheduleStatus::Pending);
        assert_eq!(p.state.last_check_success, Some(true));
        assert_eq!(p.state.last_check_timestamp, Some(t0()));
    }

    #[test]
    fn test_already_scheduled_is_not_an_error() {
        let mut p = party(Some("ABCD"));
        p.record_outcome(&failure(ErrorKind::MaintenanceMode), t0());
        let first_error = p.state.last_error.clone();

        let later = t0() + Duration::minutes(5);
        let transition = p.record_outcome(&failure(ErrorKind::AlreadyScheduled), later);

        assert_eq!(transition.new, ScheduleStatus::Scheduled);
        assert_eq!(p.state.last_error, first_error);
        assert_eq!(p.state.error_since, None);
        assert_eq!(p.error_streak(later), None);
        assert_eq!(p.state.last_check_timestamp, Some(later));
    }

    #[test]
    fn test_error_streak_starts_once() {
        let mut p = party(None);
        p.record_outcome(&failure(ErrorKind::UnexpectedPageState), t0());
        p.record_outcome(
            &failure(ErrorKind::ChallengeTimeout),
            t0() + Duration::minutes(10),
        );

        assert_eq!(p.state.error_since, Some(t0()));
        assert_eq!(
            p.error_streak(t0() + Duration::minutes(31)),
            Some(Duration::minutes(31))
        );
        assert_eq!(
            p.state.last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::ChallengeTimeout)
        );
    }

    #[test]
    fn test_recovery_clears_streak() {
        let mut p = party(None);
        p.record_outcome(&failure(ErrorKind::RateLimited), t0());
        let transition = p.record_outcome(&CheckOutcome::NoSlot, t0() + Duration::minutes(3));

        assert!(transition.left_error());
        assert_eq!(p.state.error_since, None);
        assert_eq!(p.status(), ScheduleStatus::NoAppointment);
    }
}
