// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Map from session id to independently locked per-session state.
///
/// The outer lock only guards membership; every mutation of a session's
/// state happens under that session's own mutex, so two writers for the same
/// session serialize while distinct sessions proceed in parallel.
#[derive(Debug)]
pub struct SessionMap<T> {
    entries: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T> Default for SessionMap<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> SessionMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<T>>> {
        self.entries.read().get(session_id).cloned()
    }

    pub fn get_or_insert_with(&self, session_id: &str, init: impl FnOnce() -> T) -> Arc<Mutex<T>> {
        if let Some(existing) = self.get(session_id) {
            return existing;
        }
        let mut guard = self.entries.write();
        guard
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    /// Replaces any existing entry. Holders of the previous handle keep a
    /// detached copy.
    pub fn insert(&self, session_id: &str, value: T) -> Arc<Mutex<T>> {
        let handle = Arc::new(Mutex::new(value));
        self.entries
            .write()
            .insert(session_id.to_string(), handle.clone());
        handle
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Mutex<T>>> {
        self.entries.write().remove(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.read().contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
