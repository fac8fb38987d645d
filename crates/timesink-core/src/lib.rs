// Copyright [2026] [Joseph Verdicchio]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! timesink-core
//!
//! Session progression and anti-automation core for timesink mazes:
//! - Trial graph model, templates and catalog (`maze`)
//! - Session Progress Engine with a hard restart valve and cyclic display
//!   progress (`engine`)
//! - Pure per-kind answer validators (`validate`)
//! - HMAC-signed step tokens with an optional single-use ledger (`token`)
//! - Heartbeat activity scoring with an automation discount (`activity`)
//! - Bounded chunk buffering of recorded client events (`recording`)

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod activity;
pub mod clock;
pub mod engine;
pub mod error;
pub mod maze;
pub mod random;
pub mod recording;
pub mod sessions;
pub mod token;
pub mod validate;

pub use crate::error::{TimesinkError, TimesinkResult};

pub use crate::activity::{ActivityConfig, ActivityTracker, Heartbeat, HeartbeatOutcome};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::engine::{EngineConfig, NextTrial, SessionProgressEngine, SessionState};
pub use crate::maze::{MazeCatalog, MazeDefinition, TrialKind, TrialNode};
pub use crate::random::{OsRandom, RandomSource, SeededRandom};
pub use crate::recording::{RecordingBuffer, RecordingConfig, RecordingError, RecordingEvent};
pub use crate::token::{StepTokenAuthority, TokenConfig, TokenError, TokenSecret};
pub use crate::validate::{validate_trial_answer, FailureReason, ValidationResult};
