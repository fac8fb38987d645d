// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-session buffering of recorded client events.
//!
//! Events accumulate in memory until the estimated chunk size or the event
//! count reaches its ceiling, or a caller flushes explicitly. A flush uploads
//! the whole buffer as one JSON blob, writes one artifact record for it, and
//! only then clears the buffer. A failed flush keeps every buffered event.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::sessions::SessionMap;

pub const RECORDING_ARTIFACT_KIND: &str = "recording_blob";
const CHUNK_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub max_chunk_bytes: u64,
    pub max_chunk_events: usize,
    /// Flat per-event size used for the chunk estimate.
    pub approx_event_bytes: u64,
    pub artifact_ttl_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 5 * 1024 * 1024,
            max_chunk_events: 1_000,
            approx_event_bytes: 500,
            artifact_ttl_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordingError {
    #[error("blob upload failed: {0}")]
    Upload(String),
    #[error("artifact record failed: {0}")]
    Artifact(String),
    #[error("chunk encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEvent {
    #[serde(rename = "type")]
    pub event_type: Number,
    pub data: Value,
    pub timestamp: Number,
}

/// Keeps the well-formed events: an object with a numeric `type`, a numeric
/// `timestamp`, and a `data` member. Everything else is dropped silently.
pub fn validate_events(raw: &[Value]) -> Vec<RecordingEvent> {
    raw.iter()
        .filter_map(|event| {
            let obj = event.as_object()?;
            let event_type = obj.get("type")?.as_number()?.clone();
            let timestamp = obj.get("timestamp")?.as_number()?.clone();
            let data = obj.get("data")?.clone();
            Some(RecordingEvent {
                event_type,
                data,
                timestamp,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingChunk {
    pub session_id: String,
    pub chunk_id: String,
    pub events: Vec<RecordingEvent>,
    pub start_time: u64,
    pub end_time: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub session_id: String,
    pub kind: String,
    pub uri: String,
    pub size_bytes: u64,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

pub fn chunk_key(session_id: &str, chunk_id: &str) -> String {
    format!("sessions/{session_id}/recording/{chunk_id}.json")
}

/// Object storage for chunk bodies. Returns the stored object's URI.
pub trait BlobSink: Send + Sync {
    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<String, RecordingError>;
}

pub trait ArtifactStore: Send + Sync {
    fn record(&self, artifact: ArtifactRecord) -> Result<(), RecordingError>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobSink {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().keys().cloned().collect()
    }
}

impl BlobSink for MemoryBlobSink {
    fn put(&self, key: &str, body: &[u8], _content_type: &str) -> Result<String, RecordingError> {
        self.blobs.lock().insert(key.to_string(), body.to_vec());
        Ok(format!("memory://{key}"))
    }
}

/// Writes blobs under a root directory, one file per key.
#[derive(Debug, Clone)]
pub struct FsBlobSink {
    root: PathBuf,
}

impl FsBlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, RecordingError> {
        let rel = Path::new(key);
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(RecordingError::Upload(format!("refusing blob key {key}")));
        }
        Ok(self.root.join(rel))
    }
}

impl BlobSink for FsBlobSink {
    fn put(&self, key: &str, body: &[u8], _content_type: &str) -> Result<String, RecordingError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RecordingError::Upload(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|e| RecordingError::Upload(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| RecordingError::Upload(e.to_string()))?;
        Ok(format!("file://{}", path.display()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    records: Mutex<Vec<ArtifactRecord>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ArtifactRecord> {
        self.records.lock().clone()
    }

    pub fn for_session(&self, session_id: &str) -> Vec<ArtifactRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn record(&self, artifact: ArtifactRecord) -> Result<(), RecordingError> {
        self.records.lock().push(artifact);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PendingBuffer {
    events: Vec<RecordingEvent>,
    started_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub events_accepted: usize,
    /// Set when the append crossed a ceiling and the buffer was flushed.
    pub flushed_uri: Option<String>,
}

#[derive(Debug, Default)]
pub struct FlushSweep {
    pub flushed: usize,
    pub failed: Vec<(String, RecordingError)>,
}

pub struct RecordingBuffer {
    cfg: RecordingConfig,
    clock: Arc<dyn Clock>,
    blobs: Arc<dyn BlobSink>,
    artifacts: Arc<dyn ArtifactStore>,
    sessions: SessionMap<PendingBuffer>,
}

impl RecordingBuffer {
    pub fn new(
        cfg: RecordingConfig,
        clock: Arc<dyn Clock>,
        blobs: Arc<dyn BlobSink>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            cfg,
            clock,
            blobs,
            artifacts,
            sessions: SessionMap::new(),
        }
    }

    pub fn config(&self) -> RecordingConfig {
        self.cfg
    }

    pub fn estimate_size(&self, event_count: usize) -> u64 {
        (event_count as u64).saturating_mul(self.cfg.approx_event_bytes)
    }

    /// Appends `events` and flushes if a ceiling is reached. If that flush
    /// fails the appended events are taken back out and the error returned,
    /// so the buffer is exactly as it was before the call.
    pub fn append(
        &self,
        session_id: &str,
        events: Vec<RecordingEvent>,
    ) -> Result<AppendOutcome, RecordingError> {
        let accepted = events.len();
        if accepted == 0 {
            return Ok(AppendOutcome {
                events_accepted: 0,
                flushed_uri: None,
            });
        }
        let handle = self.sessions.get_or_insert_with(session_id, PendingBuffer::default);
        let mut buf = handle.lock();
        let before_len = buf.events.len();
        let before_start = buf.started_at_ms;
        if buf.started_at_ms.is_none() {
            buf.started_at_ms = Some(self.clock.now_ms());
        }
        buf.events.extend(events);

        let full = self.estimate_size(buf.events.len()) >= self.cfg.max_chunk_bytes
            || buf.events.len() >= self.cfg.max_chunk_events;
        if !full {
            return Ok(AppendOutcome {
                events_accepted: accepted,
                flushed_uri: None,
            });
        }
        match self.flush_locked(session_id, &mut buf) {
            Ok(uri) => Ok(AppendOutcome {
                events_accepted: accepted,
                flushed_uri: uri,
            }),
            Err(err) => {
                buf.events.truncate(before_len);
                buf.started_at_ms = before_start;
                Err(err)
            }
        }
    }

    /// Flushes whatever is buffered. `Ok(None)` when there was nothing to
    /// flush.
    pub fn flush(&self, session_id: &str) -> Result<Option<String>, RecordingError> {
        let Some(handle) = self.sessions.get(session_id) else {
            return Ok(None);
        };
        let mut buf = handle.lock();
        self.flush_locked(session_id, &mut buf)
    }

    /// Flushes every non-empty buffer. A failing session is logged and the
    /// sweep continues with the next one.
    pub fn flush_all_pending(&self) -> FlushSweep {
        let mut sweep = FlushSweep::default();
        for session_id in self.sessions.session_ids() {
            match self.flush(&session_id) {
                Ok(Some(_)) => sweep.flushed += 1,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "pending recording flush failed");
                    sweep.failed.push((session_id, err));
                }
            }
        }
        sweep
    }

    pub fn pending_events(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map_or(0, |h| h.lock().events.len())
    }

    /// Drops the session's buffer without uploading it.
    pub fn discard(&self, session_id: &str) -> usize {
        let dropped = self
            .sessions
            .get(session_id)
            .map_or(0, |h| std::mem::take(&mut h.lock().events).len());
        self.sessions.remove(session_id);
        dropped
    }

    fn flush_locked(
        &self,
        session_id: &str,
        buf: &mut PendingBuffer,
    ) -> Result<Option<String>, RecordingError> {
        if buf.events.is_empty() {
            return Ok(None);
        }
        let now = self.clock.now_ms();
        let chunk = RecordingChunk {
            session_id: session_id.to_string(),
            chunk_id: Uuid::new_v4().to_string(),
            events: buf.events.clone(),
            start_time: buf.started_at_ms.unwrap_or(now),
            end_time: now,
            size_bytes: self.estimate_size(buf.events.len()),
        };
        let body = serde_json::to_vec(&chunk).map_err(|e| RecordingError::Encode(e.to_string()))?;
        let key = chunk_key(session_id, &chunk.chunk_id);
        let uri = self.blobs.put(&key, &body, CHUNK_CONTENT_TYPE)?;
        self.artifacts.record(ArtifactRecord {
            session_id: session_id.to_string(),
            kind: RECORDING_ARTIFACT_KIND.to_string(),
            uri: uri.clone(),
            size_bytes: chunk.size_bytes,
            created_at_ms: now,
            expires_at_ms: now.saturating_add(self.cfg.artifact_ttl_ms),
        })?;

        buf.events.clear();
        buf.started_at_ms = None;
        tracing::info!(
            session_id = %session_id,
            chunk_id = %chunk.chunk_id,
            events = chunk.events.len(),
            size_bytes = chunk.size_bytes,
            "recording chunk flushed"
        );
        Ok(Some(uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        clock: Arc<ManualClock>,
        blobs: Arc<MemoryBlobSink>,
        artifacts: Arc<MemoryArtifactStore>,
        buffer: RecordingBuffer,
    }

    fn harness(cfg: RecordingConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(10_000));
        let blobs = Arc::new(MemoryBlobSink::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let buffer = RecordingBuffer::new(cfg, clock.clone(), blobs.clone(), artifacts.clone());
        Harness {
            clock,
            blobs,
            artifacts,
            buffer,
        }
    }

    fn events(n: usize) -> Vec<RecordingEvent> {
        let raw: Vec<Value> = (0..n)
            .map(|i| json!({"type": 3, "data": {"i": i}, "timestamp": i}))
            .collect();
        validate_events(&raw)
    }

    #[test]
    fn validation_drops_malformed_events() {
        let raw = vec![
            json!({"type": 2, "data": {}, "timestamp": 1}),
            json!({"type": "2", "data": {}, "timestamp": 1}),
            json!({"type": 2, "timestamp": 1}),
            json!({"type": 2, "data": null, "timestamp": 1.5}),
            json!([1, 2, 3]),
        ];
        let valid = validate_events(&raw);
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[1].data, Value::Null);
    }

    #[test]
    fn small_appends_stay_buffered_until_flushed() {
        let h = harness(RecordingConfig::default());
        let out = h.buffer.append("s", events(10)).expect("append");
        assert_eq!(out.events_accepted, 10);
        assert!(out.flushed_uri.is_none());
        assert_eq!(h.buffer.pending_events("s"), 10);

        h.clock.advance(2_500);
        let uri = h.buffer.flush("s").expect("flush").expect("uri");
        assert_eq!(h.buffer.pending_events("s"), 0);
        assert!(uri.starts_with("memory://sessions/s/recording/"));

        let keys = h.blobs.keys();
        assert_eq!(keys.len(), 1);
        let chunk: RecordingChunk =
            serde_json::from_slice(&h.blobs.get(&keys[0]).expect("blob")).expect("chunk");
        assert_eq!(chunk.events.len(), 10);
        assert_eq!(chunk.start_time, 10_000);
        assert_eq!(chunk.end_time, 12_500);
        assert_eq!(chunk.size_bytes, 5_000);

        let records = h.artifacts.for_session("s");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RECORDING_ARTIFACT_KIND);
        assert_eq!(records[0].uri, uri);
        assert_eq!(records[0].expires_at_ms, 12_500 + 7 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let h = harness(RecordingConfig::default());
        assert_eq!(h.buffer.flush("nobody").expect("flush"), None);
        h.buffer.append("s", Vec::new()).expect("append");
        assert_eq!(h.buffer.flush("s").expect("flush"), None);
        assert!(h.blobs.keys().is_empty());
    }

    #[test]
    fn event_count_ceiling_triggers_flush() {
        let h = harness(RecordingConfig::default());
        assert!(h.buffer.append("s", events(999)).expect("a").flushed_uri.is_none());
        let out = h.buffer.append("s", events(1)).expect("b");
        assert!(out.flushed_uri.is_some());
        assert_eq!(h.buffer.pending_events("s"), 0);
    }

    #[test]
    fn size_ceiling_triggers_flush() {
        let h = harness(RecordingConfig {
            max_chunk_bytes: 2_000,
            ..RecordingConfig::default()
        });
        assert!(h.buffer.append("s", events(3)).expect("a").flushed_uri.is_none());
        assert!(h.buffer.append("s", events(1)).expect("b").flushed_uri.is_some());
        assert_eq!(h.artifacts.records().len(), 1);
    }

    struct BrokenSink {
        broken: AtomicBool,
        inner: MemoryBlobSink,
    }

    impl BlobSink for BrokenSink {
        fn put(&self, key: &str, body: &[u8], ct: &str) -> Result<String, RecordingError> {
            if self.broken.load(Ordering::Relaxed) {
                return Err(RecordingError::Upload("bucket offline".into()));
            }
            self.inner.put(key, body, ct)
        }
    }

    #[test]
    fn failed_flush_keeps_events_and_failed_auto_flush_rolls_back() {
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(BrokenSink {
            broken: AtomicBool::new(true),
            inner: MemoryBlobSink::new(),
        });
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let buffer = RecordingBuffer::new(
            RecordingConfig {
                max_chunk_events: 5,
                ..RecordingConfig::default()
            },
            clock,
            sink.clone(),
            artifacts.clone(),
        );

        buffer.append("s", events(3)).expect("buffered");
        assert!(buffer.flush("s").is_err());
        assert_eq!(buffer.pending_events("s"), 3);

        let err = buffer.append("s", events(2)).expect_err("auto flush fails");
        assert!(matches!(err, RecordingError::Upload(_)));
        assert_eq!(buffer.pending_events("s"), 3);
        assert!(artifacts.records().is_empty());

        sink.broken.store(false, Ordering::Relaxed);
        let sweep = buffer.flush_all_pending();
        assert_eq!(sweep.flushed, 1);
        assert!(sweep.failed.is_empty());
        assert_eq!(buffer.pending_events("s"), 0);
    }

    #[test]
    fn sweep_reports_failures_and_continues() {
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(BrokenSink {
            broken: AtomicBool::new(true),
            inner: MemoryBlobSink::new(),
        });
        let buffer = RecordingBuffer::new(
            RecordingConfig::default(),
            clock,
            sink,
            Arc::new(MemoryArtifactStore::new()),
        );
        buffer.append("a", events(1)).expect("a");
        buffer.append("b", events(1)).expect("b");
        let sweep = buffer.flush_all_pending();
        assert_eq!(sweep.flushed, 0);
        assert_eq!(sweep.failed.len(), 2);
        assert_eq!(buffer.pending_events("a") + buffer.pending_events("b"), 2);
    }

    #[test]
    fn discard_drops_without_upload() {
        let h = harness(RecordingConfig::default());
        h.buffer.append("s", events(4)).expect("append");
        assert_eq!(h.buffer.discard("s"), 4);
        assert_eq!(h.buffer.pending_events("s"), 0);
        assert!(h.blobs.keys().is_empty());
    }

    #[test]
    fn fs_sink_writes_under_root_and_refuses_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FsBlobSink::new(dir.path());
        let uri = sink
            .put(&chunk_key("s1", "c1"), b"{}", CHUNK_CONTENT_TYPE)
            .expect("put");
        assert!(uri.starts_with("file://"));
        let written = dir.path().join("sessions/s1/recording/c1.json");
        assert_eq!(std::fs::read(written).expect("read"), b"{}");
        assert!(sink.put("../escape.json", b"x", CHUNK_CONTENT_TYPE).is_err());
        assert!(sink.put("/abs.json", b"x", CHUNK_CONTENT_TYPE).is_err());
    }
}
