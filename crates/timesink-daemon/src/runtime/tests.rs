// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

use super::*;
use serde_json::json;
use timesink_core::engine::MemoryProgressStore;
use timesink_core::random::ScriptedRandom;
use timesink_core::recording::{MemoryArtifactStore, MemoryBlobSink};
use timesink_core::ManualClock;

const NOW: u64 = 1_700_000_000_000;
const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const MAZE: &str = "basic-looping-maze";

struct Rig {
    runtime: MazeRuntime,
    clock: Arc<ManualClock>,
    blobs: Arc<MemoryBlobSink>,
    artifacts: Arc<MemoryArtifactStore>,
    telemetry: Arc<Telemetry>,
}

fn rig(loop_draw: f64) -> Rig {
    rig_with(loop_draw, None)
}

fn rig_with(loop_draw: f64, journal: Option<Arc<NdjsonJournal>>) -> Rig {
    let clock = Arc::new(ManualClock::new(NOW));
    let blobs = Arc::new(MemoryBlobSink::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let telemetry = Arc::new(Telemetry::new());
    let parts = RuntimeParts {
        catalog: Arc::new(MazeCatalog::with_builtin_templates().expect("builtins")),
        clock: clock.clone(),
        rng: Arc::new(ScriptedRandom::new(Vec::new(), loop_draw)),
        secret: TokenSecret::new(b"runtime-test-secret-0123456789".to_vec()).expect("secret"),
        progress: Arc::new(MemoryProgressStore::new()),
        blobs: blobs.clone(),
        artifacts: artifacts.clone(),
        journal,
    };
    Rig {
        runtime: MazeRuntime::new(&DaemonConfig::default(), parts, telemetry.clone()),
        clock,
        blobs,
        artifacts,
        telemetry,
    }
}

fn start(rig: &Rig) -> String {
    rig.runtime
        .start_session(
            StartSessionRequest {
                maze_id: MAZE.to_string(),
            },
            Some("198.51.100.23"),
            Some("Mozilla/5.0"),
        )
        .expect("start")
        .session_id
}

fn next(rig: &Rig, session_id: &str) -> NextResponse {
    rig.runtime
        .next(SessionRequest {
            session_id: session_id.to_string(),
        })
        .expect("next")
}

fn correct_answer(kind: &str) -> Value {
    match kind {
        "image_hunt" => json!([2, 7, 11, 14]),
        "drag_sum" => json!({"selectedItems": [15, 25, 30, 30], "duration": 5100}),
        "loading_abyss" => json!({"requiredMs": 15000, "blurEvents": 0}),
        "multi_layer_captcha" => json!({"completedSteps": ["bridge", 42]}),
        "slow_reveal" => json!({"revealTimeMs": 20000}),
        other => panic!("no scripted answer for {other}"),
    }
}

fn submit(rig: &Rig, session_id: &str, token: &str, trial_id: &str, answer: Value) -> VerifyResponse {
    rig.runtime
        .verify(VerifyRequest {
            session_id: session_id.to_string(),
            token: token.to_string(),
            trial_id: trial_id.to_string(),
            answer,
        })
        .expect("verify")
}

/// Answers the current trial correctly and returns the response.
fn pass_current(rig: &Rig, session_id: &str) -> VerifyResponse {
    let shown = next(rig, session_id);
    let trial = shown.trial.expect("trial");
    let token = shown.new_token.expect("token");
    submit(rig, session_id, &token, &trial.id, correct_answer(trial.kind.as_str()))
}

#[test]
fn start_rejects_unknown_or_empty_maze() {
    let rig = rig(0.99);
    let err = rig
        .runtime
        .start_session(
            StartSessionRequest {
                maze_id: "no-such-maze".into(),
            },
            None,
            None,
        )
        .expect_err("unknown maze");
    assert!(matches!(err, RuntimeError::UnknownMaze(_)));
    assert_eq!(err.public_code(), PublicErrorCode::NotFound);

    let err = rig
        .runtime
        .start_session(StartSessionRequest { maze_id: " ".into() }, None, None)
        .expect_err("empty maze");
    assert_eq!(err.public_code(), PublicErrorCode::InvalidInput);
}

#[test]
fn start_records_bucketed_client_details() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    let handle = rig.runtime.directory().lookup(&session_id).expect("lookup");
    let record = handle.lock();
    assert_eq!(record.ip_bucket.as_deref(), Some("198.51.100.0/24"));
    assert_eq!(record.ua_hash.as_ref().map(String::len), Some(16));
    assert_eq!(record.expires_at_ms, NOW + 7 * DAY_MS);
}

#[test]
fn next_issues_token_for_the_first_trial() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    let shown = next(&rig, &session_id);
    let trial = shown.trial.expect("trial");
    assert_eq!(trial.id, "basic-looping-maze:t0");
    assert_eq!(shown.display_progress, 10);
    assert!(!shown.is_complete && !shown.should_restart);

    let claims = rig
        .runtime
        .tokens()
        .verify(&shown.new_token.expect("token"))
        .expect("claims");
    assert_eq!(claims.session_id, session_id);
    assert_eq!(claims.trial_id, trial.id);
    assert_eq!(claims.step, 0);
}

#[test]
fn correct_answers_walk_the_maze_to_completion() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    for expected_display in 1..=5 {
        match pass_current(&rig, &session_id) {
            VerifyResponse::Success {
                next_token,
                display_progress,
                is_complete,
            } => {
                assert_eq!(display_progress, expected_display);
                assert_eq!(is_complete, expected_display == 5);
                assert_eq!(next_token.is_none(), expected_display == 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    let done = next(&rig, &session_id);
    assert!(done.is_complete);
    assert!(done.trial.is_none() && done.new_token.is_none());
    assert_eq!(done.message.as_deref(), Some(COMPLETED_MESSAGE));

    let handle = rig.runtime.directory().lookup(&session_id).expect("lookup");
    let record = handle.lock();
    assert_eq!(record.trial_events.len(), 5);
    assert!(record.trial_events.iter().all(|e| e.outcome == "success"));
    assert_eq!(record.trial_events[1].duration_ms, Some(5100));
}

#[test]
fn wrong_answer_keeps_the_visitor_on_the_same_trial() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    pass_current(&rig, &session_id);

    let shown = next(&rig, &session_id);
    let trial = shown.trial.expect("trial");
    assert_eq!(trial.kind.as_str(), "drag_sum");
    let verdict = submit(
        &rig,
        &session_id,
        &shown.new_token.expect("token"),
        &trial.id,
        json!({"selectedItems": [25, 35, 40]}),
    );
    let VerifyResponse::Fail {
        reason,
        next_token,
        display_progress,
        ..
    } = verdict
    else {
        panic!("expected fail, got {verdict:?}");
    };
    assert_eq!(reason, "ItemCountMismatch");
    assert_eq!(display_progress, 1);

    let retry = next_token.expect("retry token");
    let claims = rig.runtime.tokens().verify(&retry).expect("claims");
    assert_eq!(claims.trial_id, trial.id);
    match submit(&rig, &session_id, &retry, &trial.id, correct_answer("drag_sum")) {
        VerifyResponse::Success {
            display_progress, ..
        } => assert_eq!(display_progress, 2),
        other => panic!("unexpected {other:?}"),
    }
    assert!(rig
        .telemetry
        .render()
        .contains("timesink_trial_outcomes_total{kind=\"drag_sum\",outcome=\"fail\"} 1"));
}

#[test]
fn blur_during_loading_abyss_restarts_the_session() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    pass_current(&rig, &session_id);
    pass_current(&rig, &session_id);

    let shown = next(&rig, &session_id);
    let trial = shown.trial.expect("trial");
    assert_eq!(trial.kind.as_str(), "loading_abyss");
    let verdict = submit(
        &rig,
        &session_id,
        &shown.new_token.expect("token"),
        &trial.id,
        json!({"requiredMs": 15000, "blurEvents": 2}),
    );
    assert_eq!(
        verdict,
        VerifyResponse::Restart {
            reason: Some("LeftPage".to_string()),
            message: FailureReason::LeftPage.message().to_string(),
            display_progress: RESTART_DISPLAY_PROGRESS,
            should_restart: true,
        }
    );
    let state = rig.runtime.engine().session_state(&session_id).expect("state");
    assert_eq!(state.steps_completed, 0);
    assert_eq!(state.current_trial_id.as_deref(), Some("basic-looping-maze:t0"));
}

#[test]
fn endless_loop_is_cut_off_after_twenty_steps() {
    let rig = rig(0.0);
    let session_id = start(&rig);
    for _ in 0..19 {
        assert!(matches!(
            pass_current(&rig, &session_id),
            VerifyResponse::Success { .. }
        ));
    }
    let last = pass_current(&rig, &session_id);
    assert_eq!(
        last,
        VerifyResponse::Restart {
            reason: None,
            message: STEP_LIMIT_MESSAGE.to_string(),
            display_progress: 10,
            should_restart: true,
        }
    );
    let fresh = next(&rig, &session_id);
    assert_eq!(
        fresh.trial.map(|t| t.id).as_deref(),
        Some("basic-looping-maze:t0")
    );
    assert!(rig
        .telemetry
        .render()
        .contains("timesink_restarts_total{cause=\"step_limit\"} 1"));
}

#[test]
fn tokens_are_bound_to_session_trial_and_step() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    let first = next(&rig, &session_id);
    let first_trial = first.trial.expect("trial");
    let first_token = first.new_token.expect("token");

    let verify = |token: &str, trial_id: &str| {
        rig.runtime.verify(VerifyRequest {
            session_id: session_id.clone(),
            token: token.to_string(),
            trial_id: trial_id.to_string(),
            answer: correct_answer("image_hunt"),
        })
    };

    let err = verify("not-a-token", &first_trial.id).expect_err("garbage");
    assert!(matches!(err, RuntimeError::InvalidToken(TokenError::Malformed)));
    assert_eq!(err.public_code(), PublicErrorCode::Unauthorized);

    let err = verify(&first_token, "basic-looping-maze:t1").expect_err("wrong trial");
    assert!(matches!(err, RuntimeError::InvalidToken(TokenError::TrialMismatch)));

    assert!(matches!(
        verify(&first_token, &first_trial.id).expect("first use"),
        VerifyResponse::Success { .. }
    ));
    // The session has moved on; the old token names a trial it left.
    let err = verify(&first_token, &first_trial.id).expect_err("replay");
    assert!(matches!(err, RuntimeError::InvalidToken(TokenError::TrialMismatch)));

    rig.clock.advance(rig.runtime.tokens().config().ttl_ms);
    let current = next(&rig, &session_id);
    rig.clock.advance(rig.runtime.tokens().config().ttl_ms);
    let err = verify(
        &current.new_token.expect("token"),
        &current.trial.expect("trial").id,
    )
    .expect_err("expired");
    assert!(matches!(err, RuntimeError::InvalidToken(TokenError::Expired)));
    assert!(rig
        .telemetry
        .render()
        .contains("timesink_token_rejects_total{reason=\"expired\"} 1"));
}

#[test]
fn heartbeats_credit_time_and_flag_automation_once() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    let beat = |visible: bool, input_events: u32| {
        rig.runtime.heartbeat(HeartbeatRequest {
            session_id: session_id.clone(),
            is_visible: visible,
            input_events,
            timestamp: rig.clock.now_ms(),
        })
    };

    let first = beat(true, 10).expect("first");
    assert_eq!(first.active_time_added, 0);
    assert!(!first.is_automation_suspected);

    rig.clock.advance(5_000);
    let second = beat(true, 10).expect("second");
    assert_eq!(second.active_time_added, 5_000);
    assert_eq!(second.total_active_time, 5_000);

    rig.clock.advance(5_000);
    let lazy = beat(true, 2).expect("few inputs");
    assert_eq!(lazy.active_time_added, 0);

    let err = rig
        .runtime
        .heartbeat(HeartbeatRequest {
            session_id: session_id.clone(),
            is_visible: true,
            input_events: 10,
            timestamp: rig.clock.now_ms() + 1,
        })
        .expect_err("future");
    assert_eq!(err.public_code(), PublicErrorCode::InvalidInput);
}

#[test]
fn idle_session_is_flagged_once() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    for _ in 0..3 {
        let out = rig
            .runtime
            .heartbeat(HeartbeatRequest {
                session_id: session_id.clone(),
                is_visible: false,
                input_events: 0,
                timestamp: rig.clock.now_ms(),
            })
            .expect("heartbeat");
        assert!(out.is_automation_suspected);
        rig.clock.advance(5_000);
    }
    let handle = rig.runtime.directory().lookup(&session_id).expect("lookup");
    assert_eq!(handle.lock().flags.len(), 1);
    assert!(handle.lock().has_flag(AUTOMATION_FLAG));
    assert!(rig
        .telemetry
        .render()
        .contains("timesink_automation_flags_total 1"));
}

#[test]
fn recording_accepts_valid_events_and_flushes_on_request() {
    let rig = rig(0.99);
    let session_id = start(&rig);

    let err = rig
        .runtime
        .record_events(RecordingRequest {
            session_id: session_id.clone(),
            events: vec![json!({"type": "click"}), json!(3)],
        })
        .expect_err("no valid events");
    assert_eq!(err.public_code(), PublicErrorCode::InvalidInput);

    let accepted = rig
        .runtime
        .record_events(RecordingRequest {
            session_id: session_id.clone(),
            events: vec![
                json!({"type": 3, "data": {"x": 1}, "timestamp": NOW}),
                json!({"type": 2, "data": {}, "timestamp": NOW + 10}),
                json!({"type": 2, "timestamp": NOW + 20}),
            ],
        })
        .expect("record");
    assert_eq!(
        accepted,
        RecordingResponse {
            events_processed: 2,
            uri: None
        }
    );

    let flushed = rig
        .runtime
        .flush_recording(SessionRequest {
            session_id: session_id.clone(),
        })
        .expect("flush");
    assert!(flushed.flushed);
    let uri = flushed.uri.expect("uri");
    assert!(uri.starts_with(&format!("memory://sessions/{session_id}/recording/")));
    assert_eq!(rig.blobs.keys().len(), 1);
    assert_eq!(rig.artifacts.for_session(&session_id).len(), 1);

    let again = rig
        .runtime
        .flush_recording(SessionRequest { session_id })
        .expect("flush");
    assert_eq!(
        again,
        FlushResponse {
            uri: None,
            flushed: false
        }
    );
}

#[test]
fn expired_sessions_are_gone_then_cleaned_up() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    rig.runtime
        .record_events(RecordingRequest {
            session_id: session_id.clone(),
            events: vec![json!({"type": 1, "data": null, "timestamp": NOW})],
        })
        .expect("record");

    rig.clock.advance(7 * DAY_MS + 1);
    let err = rig
        .runtime
        .next(SessionRequest {
            session_id: session_id.clone(),
        })
        .expect_err("expired");
    assert!(matches!(err, RuntimeError::SessionExpired));
    assert_eq!(err.public_code(), PublicErrorCode::Gone);

    let report = rig.runtime.cleanup_expired();
    assert_eq!(
        report,
        CleanupReport {
            sessions_removed: 1,
            events_discarded: 1,
        }
    );
    assert!(!rig.runtime.engine().is_initialized(&session_id));
    assert_eq!(rig.runtime.recording().pending_events(&session_id), 0);
    let err = rig
        .runtime
        .next(SessionRequest { session_id })
        .expect_err("removed");
    assert!(matches!(err, RuntimeError::SessionNotFound));
}

/// Swaps the journal file for a directory so every append fails.
fn break_journal(journal: &NdjsonJournal) {
    std::fs::remove_file(journal.path()).expect("remove journal");
    std::fs::create_dir(journal.path()).expect("block journal");
}

fn mend_journal(journal: &NdjsonJournal) {
    std::fs::remove_dir(journal.path()).expect("unblock journal");
}

#[test]
fn failed_flag_write_leaves_heartbeat_unapplied() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let journal = Arc::new(NdjsonJournal::new(tmp.path().join("sessions.ndjson")));
    let rig = rig_with(0.99, Some(journal.clone()));
    let session_id = start(&rig);
    break_journal(&journal);

    // An idle first heartbeat reads as automated, which needs a flag write.
    let idle = HeartbeatRequest {
        session_id: session_id.clone(),
        is_visible: false,
        input_events: 0,
        timestamp: NOW,
    };
    let err = rig.runtime.heartbeat(idle.clone()).expect_err("journal down");
    assert!(matches!(err, RuntimeError::Journal(_)));
    assert_eq!(err.public_code(), PublicErrorCode::Internal);
    assert!(rig.runtime.activity.snapshot(&session_id).is_none());
    {
        let handle = rig.runtime.directory().lookup(&session_id).expect("lookup");
        assert!(!handle.lock().has_flag(AUTOMATION_FLAG));
    }

    mend_journal(&journal);
    let beat = rig.runtime.heartbeat(idle).expect("heartbeat");
    assert!(beat.is_automation_suspected);
    assert!(rig.runtime.activity.snapshot(&session_id).is_some());
    let handle = rig.runtime.directory().lookup(&session_id).expect("lookup");
    assert!(handle.lock().has_flag(AUTOMATION_FLAG));
}

#[test]
fn failed_event_write_leaves_progress_and_token_usable() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let journal = Arc::new(NdjsonJournal::new(tmp.path().join("sessions.ndjson")));
    let rig = rig_with(0.99, Some(journal.clone()));
    let session_id = start(&rig);
    let shown = next(&rig, &session_id);
    let trial = shown.trial.expect("trial");
    let token = shown.new_token.expect("token");
    let answer = correct_answer(trial.kind.as_str());
    let before = rig.runtime.engine().session_state(&session_id).expect("state");

    break_journal(&journal);
    let err = rig
        .runtime
        .verify(VerifyRequest {
            session_id: session_id.clone(),
            token: token.clone(),
            trial_id: trial.id.clone(),
            answer: answer.clone(),
        })
        .expect_err("journal down");
    assert!(matches!(err, RuntimeError::Journal(_)));
    assert_eq!(
        rig.runtime.engine().session_state(&session_id).expect("state"),
        before
    );

    mend_journal(&journal);
    let ok = submit(&rig, &session_id, &token, &trial.id, answer);
    assert!(matches!(ok, VerifyResponse::Success { .. }));
}

#[test]
fn concurrent_submissions_of_one_token_advance_once() {
    let rig = rig(0.99);
    let session_id = start(&rig);
    let shown = next(&rig, &session_id);
    let trial = shown.trial.expect("trial");
    let token = shown.new_token.expect("token");
    let answer = correct_answer(trial.kind.as_str());

    let runtime = &rig.runtime;
    let outcomes: Vec<Result<VerifyResponse, RuntimeError>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    runtime.verify(VerifyRequest {
                        session_id: session_id.clone(),
                        token: token.clone(),
                        trial_id: trial.id.clone(),
                        answer: answer.clone(),
                    })
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker"))
            .collect()
    });

    let successes = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(VerifyResponse::Success { .. })))
        .count();
    assert_eq!(successes, 1);
    assert!(outcomes
        .iter()
        .filter(|o| o.is_err())
        .all(|o| matches!(o, Err(RuntimeError::InvalidToken(_)))));
    assert_eq!(
        runtime
            .engine()
            .session_state(&session_id)
            .expect("state")
            .steps_completed,
        1
    );
}

#[test]
fn flush_of_unknown_session_reports_nothing_flushed() {
    let rig = rig(0.99);
    let flushed = rig
        .runtime
        .flush_recording(SessionRequest {
            session_id: "never-started".into(),
        })
        .expect("flush");
    assert_eq!(
        flushed,
        FlushResponse {
            uri: None,
            flushed: false
        }
    );
}
