use crate::mail::MailError;
use crate::portal::PortalError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Portal error: {0}")]
    Portal(#[from] PortalError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
