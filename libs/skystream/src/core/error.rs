// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types for skystream
//!
//! Defines the core error types used throughout skystream. Construction
//! failures surface as `Configuration` or `Alloc`; tearing a reader down
//! while its workers are still running surfaces as `Busy`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("allocation failed: {0}")]
    Alloc(String),

    #[error("reader is busy: {0}")]
    Busy(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type that uses StreamError
pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// True for the bounded-wait conditions workers treat as a quiet retry,
    /// not a fault.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StreamError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            )
        )
    }
}
