use chrono::{DateTime, Duration, Utc};
use std::fmt;

use super::classifier::ErrorKind;
use super::party::{CheckOutcome, Party, ScheduleStatus, Transition};
use crate::mail::Mail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notice {
    SlotFound,
    BookingConfirmed,
    ErrorEscalation,
    Recovery,
    UnclassifiedAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Party,
    Admin,
}

impl Notice {
    pub fn audience(&self) -> Audience {
        match self {
            Notice::SlotFound | Notice::BookingConfirmed => Audience::Party,
            Notice::ErrorEscalation | Notice::Recovery | Notice::UnclassifiedAlert => Audience::Admin,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Notice::SlotFound => "slot_found",
            Notice::BookingConfirmed => "booking_confirmed",
            Notice::ErrorEscalation => "error_escalation",
            Notice::Recovery => "recovery",
            Notice::UnclassifiedAlert => "unclassified_alert",
        };
        f.write_str(name)
    }
}

/// Decides which notices a finished cycle warrants. Owns the
/// `error_notification_sent` flag: escalation sets it, recovery clears it,
/// and since one needs the party in `error` and the other needs it out of
/// `error`, both can never fire for the same cycle.
#[derive(Debug, Clone, Copy)]
pub struct NotificationPolicy {
    escalation_after: Duration,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            escalation_after: Duration::minutes(30),
        }
    }
}

impl NotificationPolicy {
    pub fn new(escalation_after: Duration) -> Self {
        Self { escalation_after }
    }

    pub fn evaluate(
        &self,
        party: &mut Party,
        transition: &Transition,
        outcome: &CheckOutcome,
        now: DateTime<Utc>,
    ) -> Vec<Notice> {
        let mut notices = Vec::new();

        match transition.new {
            ScheduleStatus::Pending => notices.push(Notice::SlotFound),
            ScheduleStatus::Scheduled if transition.old != ScheduleStatus::Scheduled => {
                notices.push(Notice::BookingConfirmed)
            }
            _ => {}
        }

        if transition.new != ScheduleStatus::Error {
            if transition.error_notification_sent_before {
                party.state.error_notification_sent = false;
                notices.push(Notice::Recovery);
            }
        } else if !party.state.error_notification_sent
            && party
                .error_streak(now)
                .is_some_and(|streak| streak > self.escalation_after)
        {
            party.state.error_notification_sent = true;
            notices.push(Notice::ErrorEscalation);
        }

        if outcome.error_kind() == Some(ErrorKind::Unclassified) {
            notices.push(Notice::UnclassifiedAlert);
        }

        notices
    }
}

/// Turns notices into mail text.
#[derive(Debug, Clone)]
pub struct MailComposer {
    product: String,
}

impl Default for MailComposer {
    fn default() -> Self {
        Self::new("slotwatch")
    }
}

impl MailComposer {
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
        }
    }

    fn sign(&self, text: String) -> String {
        format!("{text}\n\n-- \n{}\n", self.product)
    }

    fn timestamp(at: Option<DateTime<Utc>>) -> String {
        at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    }

    pub fn compose(
        &self,
        notice: Notice,
        party: &Party,
        recipient: &str,
        outcome: &CheckOutcome,
    ) -> Mail {
        let profile = &party.profile;
        let code = profile.code.as_deref().unwrap_or("-");
        let postal_code = profile.postal_code.as_deref().unwrap_or("-");
        let url = party
            .search_url()
            .map(|u| u.to_string())
            .unwrap_or_else(|_| profile.url.to_string());
        let product = &self.product;

        let (subject, body) = match notice {
            Notice::SlotFound => (
                format!("{product} :: Notification"),
                format!(
                    "Appointments are currently available, see the attached page.\n\n\
                     Profile Name: {}\n\
                     Reservation Code: {code}\n\n\
                     To book an appointment, use this URL:\n\n<{url}>",
                    profile.name
                ),
            ),
            Notice::BookingConfirmed => (
                format!("{product} :: Appointment scheduled"),
                format!(
                    "An appointment is scheduled for this profile.\n\n\
                     Profile Name: {}\n\
                     Reservation Code: {code}\n\n\
                     Details are available at:\n\n<{url}>",
                    profile.name
                ),
            ),
            Notice::ErrorEscalation => (
                format!("{product} :: Error ({})", profile.name),
                format!(
                    "There were persistent errors.\n\n\
                     Party: {}\n\
                     Code: {code}\n\
                     Postal Code: {postal_code}\n\n\
                     Error (failing since {}, last check at {}):\n----\n\n{}",
                    profile.name,
                    Self::timestamp(party.state.error_since),
                    Self::timestamp(party.state.last_check_timestamp),
                    party
                        .state
                        .last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default()
                ),
            ),
            Notice::Recovery => (
                format!("{product} :: Recovery ({})", profile.name),
                format!(
                    "This is a recovery notification.\n\n\
                     Party: {}\n\
                     Status: {}\n\
                     Last successful check timestamp: {}",
                    profile.name,
                    party.status(),
                    Self::timestamp(party.state.last_check_timestamp)
                ),
            ),
            Notice::UnclassifiedAlert => {
                let detail = match outcome {
                    CheckOutcome::Failed(error) => error.to_string(),
                    _ => String::new(),
                };
                (
                    format!("{product} :: Error ({})", profile.name),
                    format!(
                        "There were errors while interacting with the URL <{url}> :\n\
                         Party: {}\n\
                         Code: {code}\n\
                         Postal Code: {postal_code}\n\n\
                         Error\n----\n\n{detail}",
                        profile.name
                    ),
                )
            }
        };

        Mail::new(recipient, subject, self.sign(body))
    }

    pub fn compose_test(&self, recipient: &str) -> Mail {
        Mail::new(
            recipient,
            "Test Mail",
            self.sign(
                "This is just a test.\n\nIf you can read this text, everything is just fine!"
                    .to_string(),
            ),
        )
    }
}
