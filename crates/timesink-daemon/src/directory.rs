// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boundary-layer session records: creation with a fixed TTL, lookup that
//! tells a missing session from an expired one, per-trial submission events
//! and once-only flags.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use timesink_core::sessions::SessionMap;
use timesink_core::Clock;

use crate::journal::{append_tagged, NdjsonJournal};

pub const AUTOMATION_FLAG: &str = "automation_suspected";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("session journal write failed: {0}")]
    Journal(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFlag {
    pub reason: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialEvent {
    pub session_id: String,
    pub trial_id: String,
    pub kind: String,
    pub outcome: String,
    pub duration_ms: Option<u64>,
    pub hints_used: Option<u64>,
    pub retries: Option<u64>,
    pub meta: Option<Value>,
    pub recorded_at_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub maze_id: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub last_seen_at_ms: u64,
    pub ip_bucket: Option<String>,
    pub ua_hash: Option<String>,
    pub flags: Vec<SessionFlag>,
    /// Most recent submissions, oldest first, without their `meta`. The
    /// journal keeps every event in full.
    pub trial_events: Vec<TrialEvent>,
    #[serde(default)]
    pub trial_event_count: u64,
}

impl SessionRecord {
    pub fn has_flag(&self, reason: &str) -> bool {
        self.flags.iter().any(|f| f.reason == reason)
    }
}

/// Coarse network bucket for an address: IPv4 keeps its /24, IPv6 its /48.
pub fn bucket_ip(ip: &str) -> Option<String> {
    match ip.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            Some(format!("{a}.{b}.{c}.0/24"))
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            Some(format!("{:x}:{:x}:{:x}::/48", s[0], s[1], s[2]))
        }
    }
}

pub fn hash_user_agent(user_agent: &str) -> String {
    let digest = Sha256::digest(user_agent.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

/// Trial events held on an in-memory session record.
pub const RETAINED_TRIAL_EVENTS: usize = 20;

pub struct SessionDirectory {
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
    journal: Option<Arc<NdjsonJournal>>,
    sessions: SessionMap<SessionRecord>,
}

impl SessionDirectory {
    pub fn new(ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl_ms,
            clock,
            journal: None,
            sessions: SessionMap::new(),
        }
    }

    pub fn with_journal(mut self, journal: Arc<NdjsonJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn create(
        &self,
        maze_id: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<SessionRecord, DirectoryError> {
        let now = self.clock.now_ms();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            maze_id: maze_id.to_string(),
            created_at_ms: now,
            expires_at_ms: now.saturating_add(self.ttl_ms),
            last_seen_at_ms: now,
            ip_bucket: ip.and_then(bucket_ip),
            ua_hash: user_agent.map(hash_user_agent),
            flags: Vec::new(),
            trial_events: Vec::new(),
            trial_event_count: 0,
        };
        self.journal_append("session", &record)?;
        self.sessions.insert(&record.id, record.clone());
        Ok(record)
    }

    /// Live session handle. A session past its expiry is reported as
    /// [`DirectoryError::Expired`] until cleanup removes it.
    pub fn lookup(&self, session_id: &str) -> Result<Arc<Mutex<SessionRecord>>, DirectoryError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or(DirectoryError::NotFound)?;
        let expired = self.clock.now_ms() > handle.lock().expires_at_ms;
        if expired {
            return Err(DirectoryError::Expired);
        }
        Ok(handle)
    }

    /// Handle regardless of expiry, for cleanup.
    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<SessionRecord>>> {
        self.sessions.get(session_id)
    }

    pub fn touch(&self, record: &mut SessionRecord) {
        record.last_seen_at_ms = self.clock.now_ms();
    }

    pub fn trial_event(
        &self,
        record: &SessionRecord,
        trial_id: &str,
        kind: &str,
        success: bool,
        answer: &Value,
    ) -> TrialEvent {
        let now = self.clock.now_ms();
        TrialEvent {
            session_id: record.id.clone(),
            trial_id: trial_id.to_string(),
            kind: kind.to_string(),
            outcome: if success { "success" } else { "fail" }.to_string(),
            duration_ms: answer.get("duration").and_then(Value::as_u64),
            hints_used: answer.get("hintsUsed").and_then(Value::as_u64),
            retries: answer.get("retries").and_then(Value::as_u64),
            meta: answer.get("meta").cloned(),
            recorded_at_ms: now,
            expires_at_ms: now.saturating_add(self.ttl_ms),
        }
    }

    pub fn record_trial_event(
        &self,
        record: &mut SessionRecord,
        event: TrialEvent,
    ) -> Result<(), DirectoryError> {
        self.journal_append("trial_event", &event)?;
        record.trial_event_count = record.trial_event_count.saturating_add(1);
        record.trial_events.push(TrialEvent { meta: None, ..event });
        if record.trial_events.len() > RETAINED_TRIAL_EVENTS {
            let excess = record.trial_events.len() - RETAINED_TRIAL_EVENTS;
            record.trial_events.drain(..excess);
        }
        Ok(())
    }

    /// Sets `reason` on the session unless already present. Returns whether
    /// the flag was newly set.
    pub fn flag_once(
        &self,
        record: &mut SessionRecord,
        reason: &str,
    ) -> Result<bool, DirectoryError> {
        if record.has_flag(reason) {
            return Ok(false);
        }
        let now = self.clock.now_ms();
        let flag = SessionFlag {
            reason: reason.to_string(),
            created_at_ms: now,
            expires_at_ms: now.saturating_add(self.ttl_ms),
        };
        self.journal_append(
            "flag",
            &serde_json::json!({ "sessionId": record.id, "flag": flag }),
        )?;
        tracing::warn!(session_id = %record.id, reason = %reason, "session flagged");
        record.flags.push(flag);
        Ok(true)
    }

    pub fn expired_ids(&self, now_ms: u64) -> Vec<String> {
        self.sessions
            .session_ids()
            .into_iter()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .is_some_and(|h| h.lock().expires_at_ms < now_ms)
            })
            .collect()
    }

    /// Forgets the session. Does not take the record lock, so callers may
    /// hold it across the removal.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn journal_append<T: Serialize>(&self, entry_type: &str, body: &T) -> Result<(), DirectoryError> {
        match &self.journal {
            Some(journal) => append_tagged(journal, entry_type, body)
                .map_err(|err| DirectoryError::Journal(err.to_string())),
            None => Ok(()),
        }
    }
}
