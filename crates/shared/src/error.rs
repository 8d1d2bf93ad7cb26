use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DeviceId, RejectReason, SwitchId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    Rejected,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(value: SyncError) -> Self {
        let code = match &value {
            SyncError::CommandRejected {
                reason: RejectReason::UnknownSwitch,
                ..
            } => ErrorCode::NotFound,
            SyncError::CommandRejected { .. } => ErrorCode::Rejected,
            SyncError::Transport(_) | SyncError::Persistence(_) => ErrorCode::Internal,
        };
        Self::new(code, value.to_string())
    }
}

/// Failure classes of the synchronization engine. Transport and persistence
/// faults are recovered locally; a rejection changes what a command meant and
/// is reported to the issuer distinctly. Expiry and overrides after
/// acceptance travel as command statuses instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("command rejected for {device_id}/{switch_id}: {}", reason.as_str())]
    CommandRejected {
        device_id: DeviceId,
        switch_id: SwitchId,
        reason: RejectReason,
    },
}

impl SyncError {
    pub fn rejected(device_id: &DeviceId, switch_id: &SwitchId, reason: RejectReason) -> Self {
        Self::CommandRejected {
            device_id: device_id.clone(),
            switch_id: switch_id.clone(),
            reason,
        }
    }
}
