// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

use axum::http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicErrorCode {
    InvalidInput,
    Unauthorized,
    NotFound,
    Gone,
    Internal,
}

impl PublicErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::Gone => "GONE",
            Self::Internal => "INTERNAL",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::InvalidInput => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Gone => StatusCode::GONE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-safe message. Internal detail stays in the logs.
    pub const fn message(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid request",
            Self::Unauthorized => "invalid or expired step token",
            Self::NotFound => "not found",
            Self::Gone => "session expired",
            Self::Internal => "internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_distinct_statuses() {
        let all = [
            PublicErrorCode::InvalidInput,
            PublicErrorCode::Unauthorized,
            PublicErrorCode::NotFound,
            PublicErrorCode::Gone,
            PublicErrorCode::Internal,
        ];
        let mut statuses: Vec<u16> = all.iter().map(|c| c.status().as_u16()).collect();
        statuses.sort_unstable();
        statuses.dedup();
        assert_eq!(statuses.len(), all.len());
        assert_eq!(PublicErrorCode::Gone.status(), StatusCode::GONE);
        assert_eq!(PublicErrorCode::Unauthorized.as_str(), "UNAUTHORIZED");
    }
}
