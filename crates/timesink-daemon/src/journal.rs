// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use timesink_core::recording::{ArtifactRecord, ArtifactStore};
use timesink_core::RecordingError;

/// Append-only NDJSON file. One serialized record per line.
#[derive(Debug)]
pub struct NdjsonJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl NdjsonJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), std::io::Error> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct Entry<'a, T> {
    #[serde(rename = "type")]
    entry_type: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

/// Journal line tagged with an entry type.
pub fn append_tagged<T: Serialize>(
    journal: &NdjsonJournal,
    entry_type: &str,
    body: &T,
) -> Result<(), std::io::Error> {
    journal.append(&Entry { entry_type, body })
}

/// Recording artifact metadata persisted to a journal.
#[derive(Debug, Clone)]
pub struct JournalArtifactStore {
    journal: Arc<NdjsonJournal>,
}

impl JournalArtifactStore {
    pub fn new(journal: Arc<NdjsonJournal>) -> Self {
        Self { journal }
    }
}

impl ArtifactStore for JournalArtifactStore {
    fn record(&self, artifact: ArtifactRecord) -> Result<(), RecordingError> {
        append_tagged(&self.journal, "artifact", &artifact)
            .map_err(|err| RecordingError::Artifact(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn appends_one_tagged_line_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = NdjsonJournal::new(dir.path().join("nested/journal.ndjson"));
        append_tagged(&journal, "flag", &json!({"sessionId": "s1"})).expect("append");
        append_tagged(&journal, "flag", &json!({"sessionId": "s2"})).expect("append");

        let text = std::fs::read_to_string(journal.path()).expect("read");
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "flag");
        assert_eq!(lines[1]["sessionId"], "s2");
    }
}
