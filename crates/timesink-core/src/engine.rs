// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Session progress engine.
//!
//! Holds each session's position in its maze and walks the trial graph.
//! Transitions are computed on a copy of the session state, handed to the
//! [`ProgressStore`], and only committed in memory once the store accepts
//! them, so a failed durable write leaves the session untouched.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{TimesinkError, TimesinkResult};
use crate::maze::{Edge, MazeCatalog, MazeDefinition, TrialNode};
use crate::random::RandomSource;
use crate::sessions::SessionMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Completed-step count at which the session must restart.
    pub restart_after_steps: u32,
    /// Length of the displayed progress cycle.
    pub display_cycle: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            restart_after_steps: 20,
            display_cycle: 10,
        }
    }
}

/// Progress shown to the visitor: `steps mod cycle`, with `0` shown as the
/// full cycle, so the value walks `1..=cycle` forever.
pub fn display_progress(steps_completed: u32, cycle: u32) -> u32 {
    let cycle = cycle.max(1);
    match steps_completed % cycle {
        0 => cycle,
        rem => rem,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub maze_id: String,
    pub current_trial_id: Option<String>,
    pub completed_trial_ids: BTreeSet<String>,
    pub steps_completed: u32,
    pub restarted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NextTrial {
    pub trial: Option<TrialNode>,
    pub is_complete: bool,
    pub should_restart: bool,
    pub display_progress: u32,
}

/// Durable sink for session transitions.
pub trait ProgressStore: Send + Sync {
    fn save(&self, state: &SessionState) -> TimesinkResult<()>;

    fn remove(&self, _session_id: &str) -> TimesinkResult<()> {
        Ok(())
    }
}

/// Keeps the last saved state per session in memory.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    saved: Mutex<HashMap<String, SessionState>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, session_id: &str) -> Option<SessionState> {
        self.saved.lock().get(session_id).cloned()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn save(&self, state: &SessionState) -> TimesinkResult<()> {
        self.saved
            .lock()
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    fn remove(&self, session_id: &str) -> TimesinkResult<()> {
        self.saved.lock().remove(session_id);
        Ok(())
    }
}

pub struct SessionProgressEngine {
    cfg: EngineConfig,
    catalog: Arc<MazeCatalog>,
    store: Arc<dyn ProgressStore>,
    rng: Arc<dyn RandomSource>,
    sessions: SessionMap<SessionState>,
}

impl SessionProgressEngine {
    pub fn new(
        cfg: EngineConfig,
        catalog: Arc<MazeCatalog>,
        store: Arc<dyn ProgressStore>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            cfg,
            catalog,
            store,
            rng,
            sessions: SessionMap::new(),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.cfg
    }

    /// Places the session on the maze's position-0 node with zeroed
    /// counters. A maze without a position-0 node yields a session that is
    /// already complete.
    pub fn initialize_session(&self, session_id: &str, maze_id: &str) -> TimesinkResult<()> {
        let maze = self.maze(maze_id)?;
        let state = SessionState {
            session_id: session_id.to_string(),
            maze_id: maze_id.to_string(),
            current_trial_id: maze.first_trial().map(|t| t.id.clone()),
            completed_trial_ids: BTreeSet::new(),
            steps_completed: 0,
            restarted: false,
        };
        self.store.save(&state)?;
        tracing::debug!(
            session_id = %session_id,
            maze_id = %maze_id,
            first_trial = ?state.current_trial_id,
            "session initialized"
        );
        self.sessions.insert(session_id, state);
        Ok(())
    }

    pub fn is_initialized(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    pub fn next_trial(&self, session_id: &str) -> TimesinkResult<NextTrial> {
        let handle = self.handle(session_id)?;
        let state = handle.lock();
        let display = display_progress(state.steps_completed, self.cfg.display_cycle);

        if state.steps_completed >= self.cfg.restart_after_steps {
            return Ok(NextTrial {
                trial: None,
                is_complete: false,
                should_restart: true,
                display_progress: display,
            });
        }

        let Some(current) = state.current_trial_id.as_deref() else {
            return Ok(NextTrial {
                trial: None,
                is_complete: true,
                should_restart: false,
                display_progress: display,
            });
        };

        let maze = self.maze(&state.maze_id)?;
        let trial = maze.trial(current).cloned().ok_or_else(|| {
            TimesinkError::UnknownTrial(format!("session {session_id} points at {current}"))
        })?;
        Ok(NextTrial {
            trial: Some(trial),
            is_complete: false,
            should_restart: false,
            display_progress: display,
        })
    }

    /// Records the outcome of the current trial and moves the session to the
    /// next one. Returns the new current trial id, `None` once the maze is
    /// exhausted (or if the session had no current trial).
    pub fn complete_current_trial(
        &self,
        session_id: &str,
        success: bool,
    ) -> TimesinkResult<Option<String>> {
        let handle = self.handle(session_id)?;
        let mut state = handle.lock();
        let Some(next) = self.completed(&state, success)? else {
            return Ok(None);
        };
        self.store.save(&next)?;
        *state = next;
        Ok(state.current_trial_id.clone())
    }

    /// Applies a failed outcome only if an outgoing edge explicitly routes
    /// it. With no matching edge the session stays on the same trial so the
    /// visitor retries it; the positional fallback is never taken.
    ///
    /// Returns the (possibly unchanged) current trial id.
    pub fn route_failure(&self, session_id: &str) -> TimesinkResult<Option<String>> {
        let handle = self.handle(session_id)?;
        let mut state = handle.lock();
        let next = self.failure_routed(&state)?;
        if next != *state {
            self.store.save(&next)?;
            *state = next;
        }
        Ok(state.current_trial_id.clone())
    }

    pub fn restart_session(&self, session_id: &str) -> TimesinkResult<()> {
        let handle = self.handle(session_id)?;
        let mut state = handle.lock();
        let next = self.restarted(&state)?;
        self.store.save(&next)?;
        *state = next;
        Ok(())
    }

    /// State the session would hold after [`Self::complete_current_trial`],
    /// computed without touching the session. `None` when there is no
    /// current trial. Edge chances are drawn here, so a plan must be
    /// committed, not recomputed.
    pub fn plan_completion(
        &self,
        session_id: &str,
        success: bool,
    ) -> TimesinkResult<Option<SessionState>> {
        let handle = self.handle(session_id)?;
        let state = handle.lock();
        self.completed(&state, success)
    }

    /// State the session would hold after [`Self::route_failure`].
    pub fn plan_failure_route(&self, session_id: &str) -> TimesinkResult<SessionState> {
        let handle = self.handle(session_id)?;
        let state = handle.lock();
        self.failure_routed(&state)
    }

    /// State the session would hold after [`Self::restart_session`].
    pub fn plan_restart(&self, session_id: &str) -> TimesinkResult<SessionState> {
        let handle = self.handle(session_id)?;
        let state = handle.lock();
        self.restarted(&state)
    }

    /// Stores a planned state and makes it current. Callers serialize
    /// planning and committing per session.
    pub fn commit(&self, next: SessionState) -> TimesinkResult<()> {
        let handle = self.handle(&next.session_id)?;
        let mut state = handle.lock();
        self.store.save(&next)?;
        *state = next;
        Ok(())
    }

    fn completed(&self, state: &SessionState, success: bool) -> TimesinkResult<Option<SessionState>> {
        let Some(current) = state.current_trial_id.clone() else {
            return Ok(None);
        };
        let maze = self.maze(&state.maze_id)?;

        let mut next = state.clone();
        if success {
            next.completed_trial_ids.insert(current.clone());
            next.steps_completed = next.steps_completed.saturating_add(1);
        }
        next.current_trial_id =
            self.select_next(&maze, &current, success, next.completed_trial_ids.len())?;
        tracing::info!(
            session_id = %state.session_id,
            from_trial = %current,
            to_trial = ?next.current_trial_id,
            success,
            steps_completed = next.steps_completed,
            "trial completed"
        );
        Ok(Some(next))
    }

    fn failure_routed(&self, state: &SessionState) -> TimesinkResult<SessionState> {
        let Some(current) = state.current_trial_id.as_deref() else {
            return Ok(state.clone());
        };
        let maze = self.maze(&state.maze_id)?;
        let Some(edge) = self.matching_edge(&maze, current, false, state.completed_trial_ids.len())
        else {
            return Ok(state.clone());
        };
        tracing::info!(
            session_id = %state.session_id,
            from_trial = %current,
            to_trial = %edge.to_trial_id,
            "failure routed along edge"
        );
        let mut next = state.clone();
        next.current_trial_id = Some(edge.to_trial_id.clone());
        Ok(next)
    }

    fn restarted(&self, state: &SessionState) -> TimesinkResult<SessionState> {
        let maze = self.maze(&state.maze_id)?;
        tracing::info!(
            session_id = %state.session_id,
            abandoned_steps = state.steps_completed,
            "session restarted"
        );
        Ok(SessionState {
            current_trial_id: maze.first_trial().map(|t| t.id.clone()),
            completed_trial_ids: BTreeSet::new(),
            steps_completed: 0,
            restarted: true,
            ..state.clone()
        })
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|h| h.lock().clone())
    }

    pub fn remove_session(&self, session_id: &str) -> TimesinkResult<()> {
        self.store.remove(session_id)?;
        self.sessions.remove(session_id);
        Ok(())
    }

    fn handle(&self, session_id: &str) -> TimesinkResult<Arc<Mutex<SessionState>>> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| TimesinkError::SessionNotInitialized(session_id.to_string()))
    }

    fn maze(&self, maze_id: &str) -> TimesinkResult<Arc<MazeDefinition>> {
        self.catalog
            .get(maze_id)
            .ok_or_else(|| TimesinkError::MazeNotFound(maze_id.to_string()))
    }

    fn select_next(
        &self,
        maze: &MazeDefinition,
        current: &str,
        success: bool,
        completed: usize,
    ) -> TimesinkResult<Option<String>> {
        if let Some(edge) = self.matching_edge(maze, current, success, completed) {
            return Ok(Some(edge.to_trial_id.clone()));
        }
        sequential_successor(maze, current)
    }

    /// First outgoing edge, in authored order, whose every present clause
    /// holds. The chance clause draws afresh on every evaluation.
    fn matching_edge<'m>(
        &self,
        maze: &'m MazeDefinition,
        current: &str,
        success: bool,
        completed: usize,
    ) -> Option<&'m Edge> {
        maze.edges_from(current).find(|edge| {
            let cond = &edge.condition;
            if cond.on_success.is_some_and(|want| want != success) {
                return false;
            }
            if cond
                .min_completed
                .is_some_and(|min| completed < min as usize)
            {
                return false;
            }
            match cond.loopback_chance() {
                Some(chance) => self.rng.draw_unit() < chance,
                None => true,
            }
        })
    }
}

/// Node at `position + 1`, or `None` when the maze ends here.
fn sequential_successor(maze: &MazeDefinition, current: &str) -> TimesinkResult<Option<String>> {
    let node = maze
        .trial(current)
        .ok_or_else(|| TimesinkError::UnknownTrial(current.to_string()))?;
    Ok(node
        .position
        .checked_add(1)
        .and_then(|p| maze.trial_at(p))
        .map(|t| t.id.clone()))
}
