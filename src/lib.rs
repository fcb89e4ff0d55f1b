pub mod config;
pub mod core;
pub mod mail;
pub mod portal;
pub mod stats;
pub mod storage;

pub use config::{Config, ConfigError};
pub use self::core::{Monitor, MonitorError, MonitorResult, Party, RoundReport, ScheduleStatus};
pub use mail::{Mail, MailSender};
pub use portal::{BookingFlow, PageInteraction, PortalError};
pub use stats::StatsTracker;
pub use storage::ArtifactStore;
