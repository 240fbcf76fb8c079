// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Error kinds the durable store can surface. Matches the store-owned subset
/// of the taxonomy: `NotFound` / `Conflict` / `StoreIntegrity` / `Transient`.
/// `ContextOverflow` / `InputDoesNotFit` / `ToolFailed` / `GiveUp` are owned
/// by the agentic loop in `wuhu-core`, which wraps `StoreError` via `From`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store integrity violation: {0}")]
    StoreIntegrity(String),

    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }
}

/// Any rusqlite failure not explicitly classified above is treated as a
/// transient store error: the store never retries, but classifies every
/// failure so callers can decide whether retrying the operation makes sense.
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(e.to_string())
            }
            _ => StoreError::Transient(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Transient(format!("store task panicked: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
