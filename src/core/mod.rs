pub mod classifier;
pub mod clock;
mod errors;
pub mod monitor;
pub mod notify;
pub mod party;
pub mod session;


pub use classifier::{ClassifiedError, ErrorClassifier, ErrorKind, SignalChannel, SignalRule};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{MonitorError, MonitorResult};
pub use monitor::{Monitor, RoundReport};
pub use notify::{Audience, MailComposer, NotificationPolicy, Notice};
pub use party::{CheckOutcome, Cooldowns, MonitorState, Party, ScheduleStatus, Transition};
pub use session::Session;
