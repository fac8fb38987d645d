// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Request-level orchestration behind the HTTP routes.
//!
//! Session-bound operations (next, verify, heartbeat, recording append)
//! first take the session's directory record lock, then touch engine,
//! activity and recording state in that order. Holding the record lock for
//! the whole request serializes duplicate submissions for one session.
//!
//! An explicit recording flush is keyed only by session id and never
//! consults the directory: an unknown or expired id simply has nothing
//! buffered and reports `flushed: false`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use timesink_core::activity::HeartbeatRejection;
use timesink_core::engine::{display_progress, ProgressStore};
use timesink_core::recording::{validate_events, ArtifactStore, BlobSink, FlushSweep};
use timesink_core::{
    validate_trial_answer, ActivityTracker, Clock, FailureReason, Heartbeat, MazeCatalog,
    RandomSource, RecordingBuffer, RecordingError, SessionProgressEngine, StepTokenAuthority,
    TimesinkError, TokenError, TokenSecret, TrialNode,
};

use crate::config::DaemonConfig;
use crate::directory::{DirectoryError, SessionDirectory, SessionRecord, AUTOMATION_FLAG};
use crate::journal::NdjsonJournal;
use crate::public_error::PublicErrorCode;
use crate::telemetry::Telemetry;

pub const STEP_LIMIT_MESSAGE: &str = "(>1 of 20) answers incorrect, please try again";
pub const COMPLETED_MESSAGE: &str = "Verification process completed";
/// Shown after a validator-forced restart: the visitor is back on step one.
pub const RESTART_DISPLAY_PROGRESS: u32 = 1;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error("unknown maze {0}")]
    UnknownMaze(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("step token rejected: {0}")]
    InvalidToken(TokenError),
    #[error("step token could not be issued: {0}")]
    Signing(TokenError),
    #[error("session journal write failed: {0}")]
    Journal(String),
    #[error(transparent)]
    Engine(#[from] TimesinkError),
    #[error(transparent)]
    Recording(#[from] RecordingError),
}

impl RuntimeError {
    pub fn public_code(&self) -> PublicErrorCode {
        match self {
            Self::InvalidInput(_) => PublicErrorCode::InvalidInput,
            Self::UnknownMaze(_) | Self::SessionNotFound => PublicErrorCode::NotFound,
            Self::SessionExpired => PublicErrorCode::Gone,
            Self::InvalidToken(_) => PublicErrorCode::Unauthorized,
            Self::Signing(_) | Self::Journal(_) | Self::Engine(_) | Self::Recording(_) => {
                PublicErrorCode::Internal
            }
        }
    }
}

impl From<DirectoryError> for RuntimeError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound => Self::SessionNotFound,
            DirectoryError::Expired => Self::SessionExpired,
            DirectoryError::Journal(detail) => Self::Journal(detail),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub maze_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
    pub maze_id: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextResponse {
    pub trial: Option<TrialNode>,
    pub new_token: Option<String>,
    pub display_progress: u32,
    pub is_complete: bool,
    pub should_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub session_id: String,
    pub token: String,
    pub trial_id: String,
    #[serde(default)]
    pub answer: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum VerifyResponse {
    #[serde(rename_all = "camelCase")]
    Success {
        next_token: Option<String>,
        display_progress: u32,
        is_complete: bool,
    },
    #[serde(rename_all = "camelCase")]
    Fail {
        reason: String,
        message: String,
        next_token: Option<String>,
        display_progress: u32,
    },
    #[serde(rename_all = "camelCase")]
    Restart {
        reason: Option<String>,
        message: String,
        display_progress: u32,
        should_restart: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub session_id: String,
    pub is_visible: bool,
    pub input_events: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub active_time_added: u64,
    pub is_automation_suspected: bool,
    pub total_active_time: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRequest {
    pub session_id: String,
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingResponse {
    pub events_processed: usize,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushResponse {
    pub uri: Option<String>,
    pub flushed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions_removed: usize,
    pub events_discarded: usize,
}

/// Collaborators the runtime is assembled from.
pub struct RuntimeParts {
    pub catalog: Arc<MazeCatalog>,
    pub clock: Arc<dyn Clock>,
    pub rng: Arc<dyn RandomSource>,
    pub secret: TokenSecret,
    pub progress: Arc<dyn ProgressStore>,
    pub blobs: Arc<dyn BlobSink>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub journal: Option<Arc<NdjsonJournal>>,
}

pub struct MazeRuntime {
    catalog: Arc<MazeCatalog>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn RandomSource>,
    directory: SessionDirectory,
    engine: SessionProgressEngine,
    tokens: StepTokenAuthority,
    activity: ActivityTracker,
    recording: RecordingBuffer,
    telemetry: Arc<Telemetry>,
}

impl MazeRuntime {
    pub fn new(cfg: &DaemonConfig, parts: RuntimeParts, telemetry: Arc<Telemetry>) -> Self {
        let mut directory = SessionDirectory::new(cfg.session_ttl_ms, parts.clock.clone());
        if let Some(journal) = parts.journal {
            directory = directory.with_journal(journal);
        }
        Self {
            engine: SessionProgressEngine::new(
                cfg.engine,
                parts.catalog.clone(),
                parts.progress,
                parts.rng.clone(),
            ),
            tokens: StepTokenAuthority::new(cfg.tokens, parts.secret, parts.clock.clone()),
            activity: ActivityTracker::new(cfg.activity, parts.clock.clone()),
            recording: RecordingBuffer::new(
                cfg.recording,
                parts.clock.clone(),
                parts.blobs,
                parts.artifacts,
            ),
            directory,
            catalog: parts.catalog,
            clock: parts.clock,
            rng: parts.rng,
            telemetry,
        }
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn engine(&self) -> &SessionProgressEngine {
        &self.engine
    }

    pub fn tokens(&self) -> &StepTokenAuthority {
        &self.tokens
    }

    pub fn recording(&self) -> &RecordingBuffer {
        &self.recording
    }

    pub fn start_session(
        &self,
        req: StartSessionRequest,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<StartSessionResponse, RuntimeError> {
        let maze_id = req.maze_id.trim();
        if maze_id.is_empty() {
            return Err(RuntimeError::InvalidInput("mazeId is required".into()));
        }
        if self.catalog.get(maze_id).is_none() {
            return Err(RuntimeError::UnknownMaze(maze_id.to_string()));
        }
        let record = self.directory.create(maze_id, ip, user_agent)?;
        if let Err(err) = self.engine.initialize_session(&record.id, maze_id) {
            self.directory.remove(&record.id);
            return Err(err.into());
        }
        self.telemetry.record_session_started(maze_id);
        tracing::info!(
            session_id = %record.id,
            maze_id = %maze_id,
            ip_bucket = ?record.ip_bucket,
            "session started"
        );
        Ok(StartSessionResponse {
            session_id: record.id,
            maze_id: record.maze_id,
            expires_at: record.expires_at_ms,
        })
    }

    /// Current trial with a fresh step token. A session at the step limit is
    /// restarted here and told so; the caller then asks again.
    pub fn next(&self, req: SessionRequest) -> Result<NextResponse, RuntimeError> {
        let session_id = require_session_id(&req.session_id)?;
        let handle = self.directory.lookup(session_id)?;
        let mut record = handle.lock();
        self.directory.touch(&mut record);

        let next = self.engine.next_trial(session_id)?;
        if next.should_restart {
            self.restart(session_id, "step_limit")?;
            return Ok(NextResponse {
                trial: None,
                new_token: None,
                display_progress: next.display_progress,
                is_complete: false,
                should_restart: true,
                message: Some(STEP_LIMIT_MESSAGE.to_string()),
            });
        }
        let Some(trial) = next.trial else {
            return Ok(NextResponse {
                trial: None,
                new_token: None,
                display_progress: next.display_progress,
                is_complete: true,
                should_restart: false,
                message: Some(COMPLETED_MESSAGE.to_string()),
            });
        };
        let token = self.issue_for(session_id, &trial.id)?;
        Ok(NextResponse {
            trial: Some(trial),
            new_token: Some(token),
            display_progress: next.display_progress,
            is_complete: false,
            should_restart: false,
            message: None,
        })
    }

    /// Judges one submission. The token must verify and name the session's
    /// current trial and step before any validator runs.
    pub fn verify(&self, req: VerifyRequest) -> Result<VerifyResponse, RuntimeError> {
        let session_id = require_session_id(&req.session_id)?;
        if req.trial_id.is_empty() || req.token.is_empty() {
            return Err(RuntimeError::InvalidInput(
                "token and trialId are required".into(),
            ));
        }
        let handle = self.directory.lookup(session_id)?;
        let mut record = handle.lock();
        self.directory.touch(&mut record);

        let claims = self
            .tokens
            .check(&req.token, session_id, &req.trial_id)
            .map_err(|err| self.token_failure(session_id, err))?;
        let state = self
            .engine
            .session_state(session_id)
            .ok_or_else(|| TimesinkError::SessionNotInitialized(session_id.to_string()))?;
        if state.current_trial_id.as_deref() != Some(req.trial_id.as_str()) {
            return Err(self.token_failure(session_id, TokenError::TrialMismatch));
        }
        if claims.step != state.steps_completed {
            return Err(self.token_failure(session_id, TokenError::StepMismatch));
        }

        let current = self.engine.next_trial(session_id)?;
        if current.should_restart {
            self.restart(session_id, "step_limit")?;
            return Ok(step_limit_restart(current.display_progress));
        }
        let trial = current
            .trial
            .ok_or_else(|| TimesinkError::UnknownTrial(req.trial_id.clone()))?;

        let result = validate_trial_answer(&trial.kind, &req.answer, &trial.config, self.rng.as_ref());
        let event = self.directory.trial_event(
            &record,
            &trial.id,
            trial.kind.as_str(),
            result.success,
            &req.answer,
        );
        self.directory.record_trial_event(&mut record, event)?;
        let outcome_label = match (result.success, result.restart_on_fail) {
            (true, _) => "success",
            (false, true) => "restart",
            (false, false) => "fail",
        };
        self.telemetry
            .record_trial_outcome(trial.kind.as_str(), outcome_label);
        tracing::debug!(
            session_id = %session_id,
            trial_id = %trial.id,
            kind = %trial.kind,
            outcome = outcome_label,
            reason = ?result.reason,
            "answer judged"
        );

        // Transitions are planned, the next token is minted for the planned
        // position, and only then is the plan committed.
        let engine_cfg = self.engine.config();
        if result.success {
            let planned = self
                .engine
                .plan_completion(session_id, true)?
                .ok_or_else(|| TimesinkError::UnknownTrial(trial.id.clone()))?;
            let display = display_progress(planned.steps_completed, engine_cfg.display_cycle);
            if planned.steps_completed >= engine_cfg.restart_after_steps {
                self.restart(session_id, "step_limit")?;
                return Ok(step_limit_restart(display));
            }
            let next_token = match &planned.current_trial_id {
                Some(trial_id) => Some(self.issue_at(session_id, trial_id, planned.steps_completed)?),
                None => None,
            };
            let is_complete = planned.current_trial_id.is_none();
            self.engine.commit(planned)?;
            return Ok(VerifyResponse::Success {
                next_token,
                display_progress: display,
                is_complete,
            });
        }

        let reason = result.reason.unwrap_or(FailureReason::IncorrectAnswer);
        if result.restart_on_fail {
            self.restart(session_id, "validator")?;
            return Ok(VerifyResponse::Restart {
                reason: Some(reason.as_str().to_string()),
                message: reason.message().to_string(),
                display_progress: RESTART_DISPLAY_PROGRESS,
                should_restart: true,
            });
        }

        let planned = self.engine.plan_failure_route(session_id)?;
        let display = display_progress(planned.steps_completed, engine_cfg.display_cycle);
        let next_token = match &planned.current_trial_id {
            Some(trial_id) => Some(self.issue_at(session_id, trial_id, planned.steps_completed)?),
            None => None,
        };
        if planned != state {
            self.engine.commit(planned)?;
        }
        Ok(VerifyResponse::Fail {
            reason: reason.as_str().to_string(),
            message: reason.message().to_string(),
            next_token,
            display_progress: display,
        })
    }

    pub fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, RuntimeError> {
        let session_id = require_session_id(&req.session_id)?;
        let handle = self.directory.lookup(session_id)?;
        let mut record = handle.lock();
        self.directory.touch(&mut record);

        let heartbeat = Heartbeat {
            is_visible: req.is_visible,
            input_events: req.input_events,
            timestamp: req.timestamp,
        };
        let scored = self
            .activity
            .score_heartbeat(session_id, heartbeat)
            .map_err(|rejection| {
                let label = match rejection {
                    HeartbeatRejection::FromFuture => "from_future",
                    HeartbeatRejection::TooOld { .. } => "too_old",
                };
                self.telemetry.record_heartbeat_rejected(label);
                RuntimeError::InvalidInput(rejection.to_string())
            })?;

        // The flag is journaled before the scored heartbeat is applied.
        if scored.outcome.is_automation_suspected && self.flag_automation(&mut record)? {
            self.telemetry.record_automation_flag();
        }
        let outcome = self.activity.commit(session_id, scored);
        Ok(HeartbeatResponse {
            active_time_added: outcome.active_time_added_ms,
            is_automation_suspected: outcome.is_automation_suspected,
            total_active_time: outcome.total_active_ms,
        })
    }

    pub fn record_events(&self, req: RecordingRequest) -> Result<RecordingResponse, RuntimeError> {
        let session_id = require_session_id(&req.session_id)?;
        let handle = self.directory.lookup(session_id)?;
        let mut record = handle.lock();
        self.directory.touch(&mut record);

        let events = validate_events(&req.events);
        if events.is_empty() {
            return Err(RuntimeError::InvalidInput("no valid events".into()));
        }
        let outcome = self.recording.append(session_id, events).map_err(|err| {
            self.telemetry.record_flush_failures(1);
            tracing::error!(session_id = %session_id, error = %err, "recording flush failed");
            err
        })?;
        if outcome.flushed_uri.is_some() {
            self.telemetry.record_chunks_flushed(1);
        }
        Ok(RecordingResponse {
            events_processed: outcome.events_accepted,
            uri: outcome.flushed_uri,
        })
    }

    pub fn flush_recording(&self, req: SessionRequest) -> Result<FlushResponse, RuntimeError> {
        let session_id = require_session_id(&req.session_id)?;
        let uri = self.recording.flush(session_id).map_err(|err| {
            self.telemetry.record_flush_failures(1);
            tracing::error!(session_id = %session_id, error = %err, "recording flush failed");
            err
        })?;
        if uri.is_some() {
            self.telemetry.record_chunks_flushed(1);
        }
        Ok(FlushResponse {
            flushed: uri.is_some(),
            uri,
        })
    }

    pub fn flush_all_pending(&self) -> FlushSweep {
        let sweep = self.recording.flush_all_pending();
        self.telemetry.record_chunks_flushed(sweep.flushed as u64);
        self.telemetry.record_flush_failures(sweep.failed.len() as u64);
        sweep
    }

    /// Drops every session past its expiry together with its engine,
    /// activity and recording state. Buffered recording events are
    /// discarded, not uploaded.
    pub fn cleanup_expired(&self) -> CleanupReport {
        let now = self.clock.now_ms();
        let mut report = CleanupReport::default();
        for session_id in self.directory.expired_ids(now) {
            let Some(handle) = self.directory.get(&session_id) else {
                continue;
            };
            let _record = handle.lock();
            if let Err(err) = self.engine.remove_session(&session_id) {
                tracing::warn!(session_id = %session_id, error = %err, "progress removal failed");
                continue;
            }
            self.activity.cleanup(&session_id);
            report.events_discarded += self.recording.discard(&session_id);
            self.directory.remove(&session_id);
            report.sessions_removed += 1;
        }
        if report.sessions_removed > 0 {
            self.telemetry
                .record_sessions_expired(report.sessions_removed as u64);
            tracing::info!(
                sessions_removed = report.sessions_removed,
                events_discarded = report.events_discarded,
                "expired sessions cleaned up"
            );
        }
        report
    }

    fn restart(&self, session_id: &str, cause: &'static str) -> Result<(), RuntimeError> {
        self.engine.restart_session(session_id)?;
        self.telemetry.record_restart(cause);
        tracing::info!(session_id = %session_id, cause, "session sent back to the start");
        Ok(())
    }

    fn issue_for(&self, session_id: &str, trial_id: &str) -> Result<String, RuntimeError> {
        let step = self
            .engine
            .session_state(session_id)
            .map_or(0, |s| s.steps_completed);
        self.issue_at(session_id, trial_id, step)
    }

    fn issue_at(&self, session_id: &str, trial_id: &str, step: u32) -> Result<String, RuntimeError> {
        self.tokens
            .issue(session_id, trial_id, step)
            .map_err(RuntimeError::Signing)
    }

    fn token_failure(&self, session_id: &str, err: TokenError) -> RuntimeError {
        if !err.is_rejection() {
            return RuntimeError::Signing(err);
        }
        self.telemetry.record_token_reject(err.as_str());
        tracing::warn!(session_id = %session_id, reason = err.as_str(), "step token rejected");
        RuntimeError::InvalidToken(err)
    }

    fn flag_automation(&self, record: &mut SessionRecord) -> Result<bool, RuntimeError> {
        Ok(self.directory.flag_once(record, AUTOMATION_FLAG)?)
    }
}

fn step_limit_restart(display_progress: u32) -> VerifyResponse {
    VerifyResponse::Restart {
        reason: None,
        message: STEP_LIMIT_MESSAGE.to_string(),
        display_progress,
        should_restart: true,
    }
}

fn require_session_id(session_id: &str) -> Result<&str, RuntimeError> {
    if session_id.is_empty() {
        return Err(RuntimeError::InvalidInput("sessionId is required".into()));
    }
    Ok(session_id)
}

#[cfg(test)]
mod tests;
