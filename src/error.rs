//! Crate-level error type wrapping each module's errors.

use crate::audit::AuditError;
use crate::broker::BrokerError;
use crate::config::ConfigurationError;
use crate::jobs::{DispatchError, RegistryError};
use crate::ledger::LedgerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CampusError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),
}

pub type Result<T> = std::result::Result<T, CampusError>;
