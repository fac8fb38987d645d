// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

const LATENCY_BOUNDS_MS: [u64; 8] = [1, 5, 10, 25, 50, 100, 250, 1000];

#[derive(Debug, Default)]
struct TelemetryState {
    sessions_started_total: BTreeMap<String, u64>,
    sessions_expired_total: u64,
    trial_outcomes_total: BTreeMap<(String, String), u64>,
    restarts_total: BTreeMap<String, u64>,
    token_rejects_total: BTreeMap<String, u64>,
    automation_flags_total: u64,
    heartbeats_rejected_total: BTreeMap<String, u64>,
    recording_chunks_flushed_total: u64,
    recording_flush_failures_total: u64,
    verify_latency_ms_bucket: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    state: Arc<Mutex<TelemetryState>>,
}

fn bump<K: Ord>(map: &mut BTreeMap<K, u64>, key: K, by: u64) {
    let entry = map.entry(key).or_insert(0);
    *entry = entry.saturating_add(by);
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_started(&self, maze_id: &str) {
        bump(&mut self.state.lock().sessions_started_total, maze_id.to_string(), 1);
    }

    pub fn record_sessions_expired(&self, count: u64) {
        let mut guard = self.state.lock();
        guard.sessions_expired_total = guard.sessions_expired_total.saturating_add(count);
    }

    pub fn record_trial_outcome(&self, kind: &str, outcome: &str) {
        bump(
            &mut self.state.lock().trial_outcomes_total,
            (kind.to_string(), outcome.to_string()),
            1,
        );
    }

    pub fn record_restart(&self, cause: &str) {
        bump(&mut self.state.lock().restarts_total, cause.to_string(), 1);
    }

    pub fn record_token_reject(&self, reason: &str) {
        bump(&mut self.state.lock().token_rejects_total, reason.to_string(), 1);
    }

    pub fn record_automation_flag(&self) {
        let mut guard = self.state.lock();
        guard.automation_flags_total = guard.automation_flags_total.saturating_add(1);
    }

    pub fn record_heartbeat_rejected(&self, reason: &str) {
        bump(
            &mut self.state.lock().heartbeats_rejected_total,
            reason.to_string(),
            1,
        );
    }

    pub fn record_chunks_flushed(&self, count: u64) {
        let mut guard = self.state.lock();
        guard.recording_chunks_flushed_total =
            guard.recording_chunks_flushed_total.saturating_add(count);
    }

    pub fn record_flush_failures(&self, count: u64) {
        let mut guard = self.state.lock();
        guard.recording_flush_failures_total =
            guard.recording_flush_failures_total.saturating_add(count);
    }

    pub fn record_verify_latency_ms(&self, latency_ms: u64) {
        let bucket = LATENCY_BOUNDS_MS
            .into_iter()
            .find(|bound| latency_ms <= *bound)
            .unwrap_or(u64::MAX);
        bump(&mut self.state.lock().verify_latency_ms_bucket, bucket, 1);
    }

    pub fn render(&self) -> String {
        let guard = self.state.lock();
        let mut out = String::new();
        out.push_str("# TYPE timesink_sessions_started_total counter\n");
        for (maze_id, value) in &guard.sessions_started_total {
            let _ = writeln!(
                out,
                "timesink_sessions_started_total{{maze=\"{}\"}} {}",
                maze_id, value
            );
        }
        out.push_str("# TYPE timesink_sessions_expired_total counter\n");
        let _ = writeln!(
            out,
            "timesink_sessions_expired_total {}",
            guard.sessions_expired_total
        );
        out.push_str("# TYPE timesink_trial_outcomes_total counter\n");
        for ((kind, outcome), value) in &guard.trial_outcomes_total {
            let _ = writeln!(
                out,
                "timesink_trial_outcomes_total{{kind=\"{}\",outcome=\"{}\"}} {}",
                kind, outcome, value
            );
        }
        out.push_str("# TYPE timesink_restarts_total counter\n");
        for (cause, value) in &guard.restarts_total {
            let _ = writeln!(out, "timesink_restarts_total{{cause=\"{}\"}} {}", cause, value);
        }
        out.push_str("# TYPE timesink_token_rejects_total counter\n");
        for (reason, value) in &guard.token_rejects_total {
            let _ = writeln!(
                out,
                "timesink_token_rejects_total{{reason=\"{}\"}} {}",
                reason, value
            );
        }
        out.push_str("# TYPE timesink_automation_flags_total counter\n");
        let _ = writeln!(
            out,
            "timesink_automation_flags_total {}",
            guard.automation_flags_total
        );
        out.push_str("# TYPE timesink_heartbeats_rejected_total counter\n");
        for (reason, value) in &guard.heartbeats_rejected_total {
            let _ = writeln!(
                out,
                "timesink_heartbeats_rejected_total{{reason=\"{}\"}} {}",
                reason, value
            );
        }
        out.push_str("# TYPE timesink_recording_chunks_flushed_total counter\n");
        let _ = writeln!(
            out,
            "timesink_recording_chunks_flushed_total {}",
            guard.recording_chunks_flushed_total
        );
        out.push_str("# TYPE timesink_recording_flush_failures_total counter\n");
        let _ = writeln!(
            out,
            "timesink_recording_flush_failures_total {}",
            guard.recording_flush_failures_total
        );
        out.push_str("# TYPE timesink_verify_latency_ms_bucket counter\n");
        for (bucket, value) in &guard.verify_latency_ms_bucket {
            let bucket_label = if *bucket == u64::MAX {
                "+Inf".to_string()
            } else {
                bucket.to_string()
            };
            let _ = writeln!(
                out,
                "timesink_verify_latency_ms_bucket{{le=\"{}\"}} {}",
                bucket_label, value
            );
        }
        out
    }
}
