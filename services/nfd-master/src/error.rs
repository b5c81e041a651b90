use fleet_wire::{ErrorCode, LabelStatus, Message};
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a `SetLabels` call did not fully succeed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetLabelsError {
    #[error("{0}")]
    Unauthenticated(String),
    /// Nothing is written when the payload names another node.
    #[error("node name from request [{claimed}] does not match TLS peer name [{peer}]")]
    IdentityMismatch { claimed: String, peer: String },
    /// Some labels failed. `message` is the first failure in key order.
    #[error("{message}")]
    PartialFailure {
        message: String,
        results: BTreeMap<String, LabelStatus>,
    },
}

impl SetLabelsError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SetLabelsError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            SetLabelsError::IdentityMismatch { .. } => ErrorCode::IdentityMismatch,
            SetLabelsError::PartialFailure { .. } => ErrorCode::Storage,
        }
    }

    pub fn into_message(self) -> Message {
        let code = self.code();
        let message = self.to_string();
        let results = match self {
            SetLabelsError::PartialFailure { results, .. } => results,
            _ => BTreeMap::new(),
        };
        Message::Error {
            code,
            message,
            results,
        }
    }
}
