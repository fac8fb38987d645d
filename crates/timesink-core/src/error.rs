// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type TimesinkResult<T> = Result<T, TimesinkError>;

#[derive(Debug, Error)]
pub enum TimesinkError {
    #[error("session not initialized: {0}")]
    SessionNotInitialized(String),

    #[error("maze not found: {0}")]
    MazeNotFound(String),

    #[error("unknown trial: {0}")]
    UnknownTrial(String),

    #[error("invalid maze definition: {0}")]
    InvalidMaze(String),

    #[error("storage failure: {0}")]
    Storage(String),
}
