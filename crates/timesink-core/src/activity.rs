// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Heartbeat-driven active time with an automation discount.
//!
//! Each accepted heartbeat that is visible and carries enough input events
//! feeds the normalized deviation of its interval from the expected cadence
//! into an exponential moving average. When the average falls under the
//! automation threshold the heartbeats are too regular to be human, and
//! every credit is scaled down by the automation discount.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;
use crate::sessions::SessionMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub heartbeat_interval_ms: u64,
    pub min_input_events: u32,
    pub automation_variance_threshold: f64,
    pub automation_discount: f64,
    pub ema_alpha: f64,
    pub max_heartbeat_age_ms: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            min_input_events: 5,
            automation_variance_threshold: 0.1,
            automation_discount: 0.3,
            ema_alpha: 0.2,
            max_heartbeat_age_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub is_visible: bool,
    pub input_events: u32,
    /// Client-side send time, ms since the epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub visible_accumulated_ms: f64,
    pub last_reported_input_events: u32,
    pub timing_variance_ema: f64,
    pub is_visible: bool,
    pub last_activity_ms: u64,
}

impl ActivityRecord {
    fn fresh(now_ms: u64) -> Self {
        Self {
            visible_accumulated_ms: 0.0,
            last_reported_input_events: 0,
            timing_variance_ema: 0.0,
            is_visible: false,
            last_activity_ms: now_ms,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatRejection {
    #[error("heartbeat timestamp is in the future")]
    FromFuture,
    #[error("heartbeat is older than {max_age_ms}ms")]
    TooOld { max_age_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    pub active_time_added_ms: u64,
    pub is_automation_suspected: bool,
    pub total_active_ms: u64,
    /// True only on the heartbeat that first tipped the session into
    /// suspicion.
    pub became_suspected: bool,
}

/// A heartbeat scored against a copy of the session's record.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHeartbeat {
    pub record: ActivityRecord,
    pub outcome: HeartbeatOutcome,
}

pub struct ActivityTracker {
    cfg: ActivityConfig,
    clock: Arc<dyn Clock>,
    sessions: SessionMap<ActivityRecord>,
}

impl ActivityTracker {
    pub fn new(cfg: ActivityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            clock,
            sessions: SessionMap::new(),
        }
    }

    pub fn config(&self) -> ActivityConfig {
        self.cfg
    }

    /// Scores one heartbeat and applies it. The interval is measured between
    /// receipt times, so the first heartbeat of a session always has a zero
    /// interval.
    pub fn record_heartbeat(
        &self,
        session_id: &str,
        heartbeat: Heartbeat,
    ) -> Result<HeartbeatOutcome, HeartbeatRejection> {
        let now = self.admit(&heartbeat)?;
        let handle = self
            .sessions
            .get_or_insert_with(session_id, || ActivityRecord::fresh(now));
        let mut record = handle.lock();
        let (next, outcome) = self.score(&record, &heartbeat, now);
        *record = next;
        self.log_tipped(session_id, &record, &outcome);
        Ok(outcome)
    }

    /// Same scoring as [`Self::record_heartbeat`] without applying it. The
    /// session's record changes only when the result is passed to
    /// [`Self::commit`].
    pub fn score_heartbeat(
        &self,
        session_id: &str,
        heartbeat: Heartbeat,
    ) -> Result<ScoredHeartbeat, HeartbeatRejection> {
        let now = self.admit(&heartbeat)?;
        let current = self
            .snapshot(session_id)
            .unwrap_or_else(|| ActivityRecord::fresh(now));
        let (record, outcome) = self.score(&current, &heartbeat, now);
        Ok(ScoredHeartbeat { record, outcome })
    }

    /// Applies a scored heartbeat. Callers serialize scoring and committing
    /// per session.
    pub fn commit(&self, session_id: &str, scored: ScoredHeartbeat) -> HeartbeatOutcome {
        let ScoredHeartbeat { record, outcome } = scored;
        self.log_tipped(session_id, &record, &outcome);
        self.sessions.insert(session_id, record);
        outcome
    }

    fn admit(&self, heartbeat: &Heartbeat) -> Result<u64, HeartbeatRejection> {
        let now = self.clock.now_ms();
        if heartbeat.timestamp > now {
            return Err(HeartbeatRejection::FromFuture);
        }
        if now - heartbeat.timestamp > self.cfg.max_heartbeat_age_ms {
            return Err(HeartbeatRejection::TooOld {
                max_age_ms: self.cfg.max_heartbeat_age_ms,
            });
        }
        Ok(now)
    }

    fn score(
        &self,
        current: &ActivityRecord,
        heartbeat: &Heartbeat,
        now: u64,
    ) -> (ActivityRecord, HeartbeatOutcome) {
        let was_suspected = self.suspicious(current);
        let delta_ms = now.saturating_sub(current.last_activity_ms);
        let mut record = current.clone();

        let mut added = 0.0;
        if heartbeat.is_visible && heartbeat.input_events >= self.cfg.min_input_events {
            let expected = self.cfg.heartbeat_interval_ms.max(1) as f64;
            let deviation = (delta_ms as f64 - expected).abs() / expected;
            let alpha = self.cfg.ema_alpha;
            record.timing_variance_ema = record.timing_variance_ema * (1.0 - alpha) + deviation * alpha;

            let multiplier = if self.suspicious(&record) {
                self.cfg.automation_discount
            } else {
                1.0
            };
            added = (delta_ms.min(self.cfg.heartbeat_interval_ms) as f64) * multiplier;
            record.visible_accumulated_ms += added;
        }

        record.last_reported_input_events = heartbeat.input_events;
        record.is_visible = heartbeat.is_visible;
        record.last_activity_ms = now;

        let suspected = self.suspicious(&record);
        let outcome = HeartbeatOutcome {
            active_time_added_ms: added.floor() as u64,
            is_automation_suspected: suspected,
            total_active_ms: record.visible_accumulated_ms.floor() as u64,
            became_suspected: suspected && !was_suspected,
        };
        (record, outcome)
    }

    fn log_tipped(&self, session_id: &str, record: &ActivityRecord, outcome: &HeartbeatOutcome) {
        if outcome.became_suspected {
            tracing::warn!(
                session_id = %session_id,
                variance_ema = record.timing_variance_ema,
                "heartbeat timing looks automated"
            );
        }
    }

    /// Literal threshold test on the moving average. A session whose
    /// heartbeats never qualified keeps its initial average of zero and so
    /// reads as suspected.
    pub fn is_automation_suspected(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|h| self.suspicious(&h.lock()))
    }

    pub fn total_active_ms(&self, session_id: &str) -> u64 {
        self.sessions
            .get(session_id)
            .map_or(0, |h| h.lock().visible_accumulated_ms.floor() as u64)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<ActivityRecord> {
        self.sessions.get(session_id).map(|h| h.lock().clone())
    }

    pub fn cleanup(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn suspicious(&self, record: &ActivityRecord) -> bool {
        record.timing_variance_ema < self.cfg.automation_variance_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    const START: u64 = 1_700_000_000_000;

    fn tracker(clock: Arc<ManualClock>) -> ActivityTracker {
        ActivityTracker::new(ActivityConfig::default(), clock)
    }

    fn beat(clock: &ManualClock, visible: bool, inputs: u32) -> Heartbeat {
        Heartbeat {
            is_visible: visible,
            input_events: inputs,
            timestamp: clock.now_ms(),
        }
    }

    #[test]
    fn too_few_inputs_credit_nothing() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        t.record_heartbeat("s", beat(&clock, true, 7)).expect("first");
        clock.advance(4_000);
        let out = t.record_heartbeat("s", beat(&clock, true, 2)).expect("sparse");
        assert_eq!(out.active_time_added_ms, 0);
        assert_eq!(t.total_active_ms("s"), 0);
    }

    #[test]
    fn hidden_tab_credits_nothing() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        t.record_heartbeat("s", beat(&clock, true, 9)).expect("first");
        clock.advance(3_000);
        let out = t.record_heartbeat("s", beat(&clock, false, 50)).expect("hidden");
        assert_eq!(out.active_time_added_ms, 0);
        assert!(!t.snapshot("s").expect("record").is_visible);
    }

    #[test]
    fn first_heartbeat_scores_zero_interval() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        let out = t.record_heartbeat("s", beat(&clock, true, 9)).expect("first");
        assert_eq!(out.active_time_added_ms, 0);
        let record = t.snapshot("s").expect("record");
        assert!((record.timing_variance_ema - 0.2).abs() < 1e-12);
        assert!(!out.is_automation_suspected);
    }

    #[test]
    fn regular_cadence_is_discounted() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        t.record_heartbeat("s", beat(&clock, true, 9)).expect("first");

        let mut credits = Vec::new();
        let mut flagged_at = None;
        for i in 0..6 {
            clock.advance(5_000);
            let out = t.record_heartbeat("s", beat(&clock, true, 9)).expect("beat");
            credits.push(out.active_time_added_ms);
            if out.became_suspected {
                flagged_at = Some(i);
            }
        }
        // 0.2 * 0.8^n drops under 0.1 on the fourth regular beat.
        assert_eq!(flagged_at, Some(3));
        assert_eq!(credits, vec![5_000, 5_000, 5_000, 1_500, 1_500, 1_500]);
        assert!(t.is_automation_suspected("s"));
        assert_eq!(t.total_active_ms("s"), 19_500);
    }

    #[test]
    fn irregular_cadence_stays_clean() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        t.record_heartbeat("s", beat(&clock, true, 9)).expect("first");
        for gap in [3_000, 8_000, 2_500, 9_000, 4_000, 7_500] {
            clock.advance(gap);
            t.record_heartbeat("s", beat(&clock, true, 9)).expect("beat");
        }
        assert!(!t.is_automation_suspected("s"));
    }

    #[test]
    fn long_gap_is_capped_at_interval() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        t.record_heartbeat("s", beat(&clock, true, 9)).expect("first");
        clock.advance(45_000);
        let out = t.record_heartbeat("s", beat(&clock, true, 9)).expect("late");
        assert_eq!(out.active_time_added_ms, 5_000);
    }

    #[test]
    fn stale_and_future_heartbeats_are_rejected_without_state() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        let future = Heartbeat {
            is_visible: true,
            input_events: 9,
            timestamp: START + 1,
        };
        assert_eq!(
            t.record_heartbeat("s", future),
            Err(HeartbeatRejection::FromFuture)
        );
        let stale = Heartbeat {
            timestamp: START - 60_001,
            ..future
        };
        assert!(matches!(
            t.record_heartbeat("s", stale),
            Err(HeartbeatRejection::TooOld { .. })
        ));
        assert!(t.snapshot("s").is_none());

        let edge = Heartbeat {
            timestamp: START - 60_000,
            ..future
        };
        assert!(t.record_heartbeat("s", edge).is_ok());
    }

    #[test]
    fn unknown_session_is_not_suspected_and_cleanup_forgets() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        assert!(!t.is_automation_suspected("ghost"));
        assert_eq!(t.total_active_ms("ghost"), 0);

        t.record_heartbeat("s", beat(&clock, false, 0)).expect("idle");
        // Never qualified: the average is still zero.
        assert!(t.is_automation_suspected("s"));
        t.cleanup("s");
        assert!(t.snapshot("s").is_none());
        assert_eq!(t.tracked_sessions(), 0);
    }

    #[test]
    fn scoring_alone_changes_nothing() {
        let clock = Arc::new(ManualClock::new(START));
        let t = tracker(clock.clone());
        let scored = t.score_heartbeat("s", beat(&clock, true, 9)).expect("score");
        assert!(t.snapshot("s").is_none());
        assert!(!scored.outcome.is_automation_suspected);

        let applied = t.commit("s", scored.clone());
        assert_eq!(applied, scored.outcome);
        assert_eq!(t.snapshot("s"), Some(scored.record));

        clock.advance(5_000);
        let second = t.score_heartbeat("s", beat(&clock, true, 9)).expect("score");
        assert_eq!(second.outcome.active_time_added_ms, 5_000);
        assert_eq!(t.total_active_ms("s"), 0);
    }

    proptest! {
        #[test]
        fn credit_never_exceeds_interval(gaps in prop::collection::vec(0u64..120_000, 1..40)) {
            let clock = Arc::new(ManualClock::new(START));
            let t = tracker(clock.clone());
            let mut total = 0u64;
            for gap in gaps {
                clock.advance(gap);
                let out = t.record_heartbeat("s", beat(&clock, true, 9)).expect("beat");
                prop_assert!(out.active_time_added_ms <= 5_000);
                total += out.active_time_added_ms;
            }
            prop_assert!(t.total_active_ms("s") + 40 >= total);
            prop_assert!(t.total_active_ms("s") <= total + 40);
        }
    }
}
