// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Published trial graphs.
//!
//! A maze is fixed once published: nodes, positions and edges are read-only
//! at runtime. [`MazeDefinition`] validates the graph on construction and
//! keeps the lookup indices the engine needs (by id, by position, outgoing
//! edges in authored order).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{TimesinkError, TimesinkResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TrialKind {
    ImageHunt,
    DragSum,
    TracePath,
    AudioGate,
    CaptchaLoopback,
    LoadingAbyss,
    MultiLayerCaptcha,
    ColorGradientMatch,
    PixelPerfectClick,
    SlowReveal,
    InvisibleMaze,
    MathChain,
    DocumentReview,
    KeypressCombo,
    VideoFrameSearch,
    LoopedAlmostDone,
    /// A tag no validator understands. Kept verbatim so it round-trips.
    Unknown(String),
}

impl TrialKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ImageHunt => "image_hunt",
            Self::DragSum => "drag_sum",
            Self::TracePath => "trace_path",
            Self::AudioGate => "audio_gate",
            Self::CaptchaLoopback => "captcha_loopback",
            Self::LoadingAbyss => "loading_abyss",
            Self::MultiLayerCaptcha => "multi_layer_captcha",
            Self::ColorGradientMatch => "color_gradient_match",
            Self::PixelPerfectClick => "pixel_perfect_click",
            Self::SlowReveal => "slow_reveal",
            Self::InvisibleMaze => "invisible_maze",
            Self::MathChain => "math_chain",
            Self::DocumentReview => "document_review",
            Self::KeypressCombo => "keypress_combo",
            Self::VideoFrameSearch => "video_frame_search",
            Self::LoopedAlmostDone => "looped_almost_done",
            Self::Unknown(tag) => tag.as_str(),
        }
    }
}

impl From<&str> for TrialKind {
    fn from(tag: &str) -> Self {
        match tag {
            "image_hunt" => Self::ImageHunt,
            "drag_sum" => Self::DragSum,
            "trace_path" => Self::TracePath,
            "audio_gate" => Self::AudioGate,
            "captcha_loopback" => Self::CaptchaLoopback,
            "loading_abyss" => Self::LoadingAbyss,
            "multi_layer_captcha" => Self::MultiLayerCaptcha,
            "color_gradient_match" => Self::ColorGradientMatch,
            "pixel_perfect_click" => Self::PixelPerfectClick,
            "slow_reveal" => Self::SlowReveal,
            "invisible_maze" => Self::InvisibleMaze,
            "math_chain" => Self::MathChain,
            "document_review" => Self::DocumentReview,
            "keypress_combo" => Self::KeypressCombo,
            "video_frame_search" => Self::VideoFrameSearch,
            "looped_almost_done" => Self::LoopedAlmostDone,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for TrialKind {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<TrialKind> for String {
    fn from(kind: TrialKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for TrialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialNode {
    pub id: String,
    pub kind: TrialKind,
    pub position: u32,
    #[serde(default)]
    pub config: Value,
}

/// Predicate gating an edge. Every clause that is present must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub loopback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_completed: Option<u32>,
}

impl EdgeCondition {
    /// The probabilistic clause is only in force for loopback edges carrying
    /// a chance.
    pub fn loopback_chance(&self) -> Option<f64> {
        if self.loopback {
            self.chance
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from_trial_id: String,
    pub to_trial_id: String,
    #[serde(default)]
    pub condition: EdgeCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MazeDefinitionDoc {
    id: String,
    #[serde(default)]
    name: String,
    trials: Vec<TrialNode>,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "MazeDefinitionDoc", into = "MazeDefinitionDoc")]
pub struct MazeDefinition {
    id: String,
    name: String,
    trials: Vec<TrialNode>,
    edges: Vec<Edge>,
    by_id: HashMap<String, usize>,
    by_position: BTreeMap<u32, usize>,
    outgoing: HashMap<String, Vec<usize>>,
}

impl MazeDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        trials: Vec<TrialNode>,
        edges: Vec<Edge>,
    ) -> TimesinkResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(TimesinkError::InvalidMaze("maze id must not be empty".into()));
        }

        let mut by_id = HashMap::with_capacity(trials.len());
        let mut by_position = BTreeMap::new();
        for (idx, trial) in trials.iter().enumerate() {
            if trial.id.is_empty() {
                return Err(TimesinkError::InvalidMaze(format!(
                    "trial at position {} has an empty id",
                    trial.position
                )));
            }
            if by_id.insert(trial.id.clone(), idx).is_some() {
                return Err(TimesinkError::InvalidMaze(format!(
                    "duplicate trial id {}",
                    trial.id
                )));
            }
            if by_position.insert(trial.position, idx).is_some() {
                return Err(TimesinkError::InvalidMaze(format!(
                    "duplicate trial position {}",
                    trial.position
                )));
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, edge) in edges.iter().enumerate() {
            for endpoint in [&edge.from_trial_id, &edge.to_trial_id] {
                if !by_id.contains_key(endpoint) {
                    return Err(TimesinkError::InvalidMaze(format!(
                        "edge references unknown trial {endpoint}"
                    )));
                }
            }
            if let Some(chance) = edge.condition.chance {
                if !(0.0..=1.0).contains(&chance) {
                    return Err(TimesinkError::InvalidMaze(format!(
                        "edge chance {chance} outside [0, 1]"
                    )));
                }
            }
            outgoing
                .entry(edge.from_trial_id.clone())
                .or_default()
                .push(idx);
        }

        Ok(Self {
            id,
            name: name.into(),
            trials,
            edges,
            by_id,
            by_position,
            outgoing,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trials(&self) -> &[TrialNode] {
        &self.trials
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn trial(&self, trial_id: &str) -> Option<&TrialNode> {
        self.by_id.get(trial_id).map(|idx| &self.trials[*idx])
    }

    pub fn trial_at(&self, position: u32) -> Option<&TrialNode> {
        self.by_position.get(&position).map(|idx| &self.trials[*idx])
    }

    /// The entry node, if the maze has one.
    pub fn first_trial(&self) -> Option<&TrialNode> {
        self.trial_at(0)
    }

    /// Outgoing edges of `trial_id` in authored order.
    pub fn edges_from<'a>(&'a self, trial_id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.outgoing
            .get(trial_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |idx| &self.edges[*idx])
    }
}

impl TryFrom<MazeDefinitionDoc> for MazeDefinition {
    type Error = TimesinkError;

    fn try_from(doc: MazeDefinitionDoc) -> Result<Self, Self::Error> {
        Self::new(doc.id, doc.name, doc.trials, doc.edges)
    }
}

impl From<MazeDefinition> for MazeDefinitionDoc {
    fn from(maze: MazeDefinition) -> Self {
        Self {
            id: maze.id,
            name: maze.name,
            trials: maze.trials,
            edges: maze.edges,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialTemplate {
    pub position: u32,
    pub kind: TrialKind,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeTemplate {
    pub from_position: u32,
    pub to_position: u32,
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Author-facing maze shape where edges address trials by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MazeTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trials: Vec<TrialTemplate>,
    #[serde(default)]
    pub edges: Vec<EdgeTemplate>,
}

impl MazeTemplate {
    /// Assigns trial ids (`{maze_id}:t{position}`) and freezes the graph.
    pub fn publish(&self, maze_id: &str) -> TimesinkResult<MazeDefinition> {
        let trial_id = |position: u32| format!("{maze_id}:t{position}");
        let positions: HashSet<u32> = self.trials.iter().map(|t| t.position).collect();

        let trials = self
            .trials
            .iter()
            .map(|t| TrialNode {
                id: trial_id(t.position),
                kind: t.kind.clone(),
                position: t.position,
                config: t.config.clone(),
            })
            .collect();

        let mut edges = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            for position in [edge.from_position, edge.to_position] {
                if !positions.contains(&position) {
                    return Err(TimesinkError::InvalidMaze(format!(
                        "template {} edge references missing position {position}",
                        self.id
                    )));
                }
            }
            edges.push(Edge {
                from_trial_id: trial_id(edge.from_position),
                to_trial_id: trial_id(edge.to_position),
                condition: edge.condition.clone(),
            });
        }

        MazeDefinition::new(maze_id, self.name.clone(), trials, edges)
    }
}

fn trial(position: u32, kind: TrialKind, config: Value) -> TrialTemplate {
    TrialTemplate {
        position,
        kind,
        config,
    }
}

fn loopback(from_position: u32, to_position: u32, chance: f64) -> EdgeTemplate {
    EdgeTemplate {
        from_position,
        to_position,
        condition: EdgeCondition {
            loopback: true,
            chance: Some(chance),
            ..EdgeCondition::default()
        },
    }
}

fn on_failure(from_position: u32, to_position: u32) -> EdgeTemplate {
    EdgeTemplate {
        from_position,
        to_position,
        condition: EdgeCondition {
            on_success: Some(false),
            ..EdgeCondition::default()
        },
    }
}

/// Templates shipped with the service.
pub fn builtin_templates() -> Vec<MazeTemplate> {
    vec![
        MazeTemplate {
            id: "basic-looping-maze".to_string(),
            name: "Basic Looping Maze".to_string(),
            description: "Five tasks that loop back to the start most of the time".to_string(),
            trials: vec![
                trial(
                    0,
                    TrialKind::ImageHunt,
                    json!({"tiles": 16, "pattern": [2, 7, 11, 14], "minMs": 3000}),
                ),
                trial(
                    1,
                    TrialKind::DragSum,
                    json!({"target": 100, "exactly": 4, "items": [15, 25, 30, 35, 40, 45]}),
                ),
                trial(
                    2,
                    TrialKind::LoadingAbyss,
                    json!({"minMs": 15000, "resetOnBlur": true}),
                ),
                trial(
                    3,
                    TrialKind::MultiLayerCaptcha,
                    json!({"steps": [
                        {"type": "image", "expectedAnswer": "bridge"},
                        {"type": "math", "expectedAnswer": 42}
                    ]}),
                ),
                trial(
                    4,
                    TrialKind::SlowReveal,
                    json!({"minRevealMs": 20000, "expectedAnswer": "VERIFY"}),
                ),
            ],
            edges: vec![loopback(4, 0, 0.8)],
        },
        MazeTemplate {
            id: "account-unlock".to_string(),
            name: "Account Unlock".to_string(),
            description: "Security-themed chain with failure detours".to_string(),
            trials: vec![
                trial(
                    0,
                    TrialKind::CaptchaLoopback,
                    json!({"rule": "select-numbers", "expectedAnswer": "9437"}),
                ),
                trial(
                    1,
                    TrialKind::MathChain,
                    json!({"expectedAnswers": [42, 84, 21], "minDelayMs": 2000}),
                ),
                trial(2, TrialKind::InvisibleMaze, json!({"requiredCues": 12})),
                trial(
                    3,
                    TrialKind::DocumentReview,
                    json!({"requiredPages": 5, "expectedAnswers": {
                        "security_policy": "section_3",
                        "data_retention": "90_days",
                        "contact_method": "email_only"
                    }}),
                ),
                trial(
                    4,
                    TrialKind::KeypressCombo,
                    json!({
                        "expectedSequence": ["ArrowUp", "ArrowDown", "ArrowLeft", "ArrowRight", "Enter"],
                        "windowMs": 800
                    }),
                ),
                trial(
                    5,
                    TrialKind::VideoFrameSearch,
                    json!({"expectedWord": "UNLOCK", "expectedTimestamp": 87000, "toleranceMs": 500}),
                ),
                trial(
                    6,
                    TrialKind::AudioGate,
                    json!({"correctTimestamp": 23450, "toleranceMs": 300}),
                ),
                trial(
                    7,
                    TrialKind::MultiLayerCaptcha,
                    json!({"steps": [
                        {"type": "rotate", "expectedAnswer": "upright"},
                        {"type": "count", "expectedAnswer": 7},
                        {"type": "sequence", "expectedAnswer": "ascending"}
                    ]}),
                ),
            ],
            edges: vec![loopback(7, 1, 0.6), on_failure(4, 2)],
        },
    ]
}

/// Read-only set of published mazes.
#[derive(Debug, Clone, Default)]
pub struct MazeCatalog {
    mazes: HashMap<String, Arc<MazeDefinition>>,
}

impl MazeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes every built-in template under its template id.
    pub fn with_builtin_templates() -> TimesinkResult<Self> {
        let mut catalog = Self::new();
        for template in builtin_templates() {
            catalog.insert(template.publish(&template.id)?)?;
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, maze: MazeDefinition) -> TimesinkResult<()> {
        if self.mazes.contains_key(maze.id()) {
            return Err(TimesinkError::InvalidMaze(format!(
                "maze {} already published",
                maze.id()
            )));
        }
        self.mazes.insert(maze.id().to_string(), Arc::new(maze));
        Ok(())
    }

    /// Loads every `*.json` maze definition in `dir`.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> TimesinkResult<usize> {
        let entries = fs::read_dir(dir.as_ref())
            .map_err(|e| TimesinkError::Storage(format!("read maze dir: {e}")))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TimesinkError::Storage(format!("read maze dir: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let bytes = fs::read(path).map_err(|e| {
                TimesinkError::Storage(format!("read maze {}: {e}", path.display()))
            })?;
            let maze: MazeDefinition = serde_json::from_slice(&bytes).map_err(|e| {
                TimesinkError::InvalidMaze(format!("parse maze {}: {e}", path.display()))
            })?;
            tracing::info!(maze_id = %maze.id(), trials = maze.trials().len(), "loaded maze definition");
            self.insert(maze)?;
        }
        Ok(paths.len())
    }

    pub fn get(&self, maze_id: &str) -> Option<Arc<MazeDefinition>> {
        self.mazes.get(maze_id).cloned()
    }

    pub fn maze_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.mazes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.mazes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mazes.is_empty()
    }
}
