// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use thiserror::Error;
use timesink_core::{ActivityConfig, EngineConfig, RecordingConfig, TokenConfig, TokenError, TokenSecret};

pub const TOKEN_SECRET_ENV: &str = "TIMESINK_TOKEN_SECRET";

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: String,
    pub metrics_listen: Option<String>,
    pub max_body_bytes: usize,
    pub data_dir: PathBuf,
    pub maze_dir: Option<PathBuf>,
    pub session_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
    pub engine: EngineConfig,
    pub tokens: TokenConfig,
    pub activity: ActivityConfig,
    pub recording: RecordingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            metrics_listen: None,
            max_body_bytes: 8 * 1024 * 1024,
            data_dir: PathBuf::from("./data"),
            maze_dir: None,
            session_ttl_ms: 7 * DAY_MS,
            cleanup_interval_ms: 10 * 60 * 1000,
            engine: EngineConfig::default(),
            tokens: TokenConfig::default(),
            activity: ActivityConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Defaults overridden by any valid, non-zero `TIMESINK_*` variable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(listen) = std::env::var("TIMESINK_LISTEN") {
            cfg.listen = listen;
        }
        cfg.metrics_listen = std::env::var("TIMESINK_METRICS_LISTEN").ok();
        if let Ok(dir) = std::env::var("TIMESINK_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        cfg.maze_dir = std::env::var("TIMESINK_MAZE_DIR").ok().map(PathBuf::from);
        cfg.max_body_bytes = read_env_usize("TIMESINK_MAX_BODY_BYTES", cfg.max_body_bytes);
        cfg.session_ttl_ms = read_env_u64("TIMESINK_SESSION_TTL_MS", cfg.session_ttl_ms);
        cfg.cleanup_interval_ms =
            read_env_u64("TIMESINK_CLEANUP_INTERVAL_MS", cfg.cleanup_interval_ms);

        cfg.engine.restart_after_steps = read_env_u64(
            "TIMESINK_RESTART_AFTER_STEPS",
            u64::from(cfg.engine.restart_after_steps),
        )
        .min(u64::from(u32::MAX)) as u32;
        cfg.engine.display_cycle = read_env_u64(
            "TIMESINK_DISPLAY_CYCLE",
            u64::from(cfg.engine.display_cycle),
        )
        .min(u64::from(u32::MAX)) as u32;

        cfg.tokens.ttl_ms = read_env_u64("TIMESINK_TOKEN_TTL_MS", cfg.tokens.ttl_ms);
        cfg.tokens.single_use = read_env_bool("TIMESINK_TOKEN_SINGLE_USE", cfg.tokens.single_use);

        cfg.activity.heartbeat_interval_ms = read_env_u64(
            "TIMESINK_HEARTBEAT_INTERVAL_MS",
            cfg.activity.heartbeat_interval_ms,
        );
        cfg.activity.max_heartbeat_age_ms = read_env_u64(
            "TIMESINK_HEARTBEAT_MAX_AGE_MS",
            cfg.activity.max_heartbeat_age_ms,
        );

        cfg.recording.max_chunk_bytes =
            read_env_u64("TIMESINK_RECORDING_MAX_CHUNK_BYTES", cfg.recording.max_chunk_bytes);
        cfg.recording.max_chunk_events = read_env_usize(
            "TIMESINK_RECORDING_MAX_CHUNK_EVENTS",
            cfg.recording.max_chunk_events,
        );
        cfg.recording.artifact_ttl_ms =
            read_env_u64("TIMESINK_ARTIFACT_TTL_MS", cfg.recording.artifact_ttl_ms);
        cfg
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no") => false,
        _ => default,
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{TOKEN_SECRET_ENV} is not set")]
    MissingSecret,
    #[error("{TOKEN_SECRET_ENV} is unusable: {0}")]
    InvalidSecret(TokenError),
}

/// Resolves the step-token secret from a raw value. An absent value is fatal
/// when `require` is set; otherwise a random per-process secret is generated,
/// which invalidates outstanding tokens on every restart.
pub fn token_secret_from(raw: Option<String>, require: bool) -> Result<TokenSecret, ConfigError> {
    match raw.filter(|v| !v.is_empty()) {
        Some(value) => TokenSecret::new(value.into_bytes()).map_err(ConfigError::InvalidSecret),
        None if require => Err(ConfigError::MissingSecret),
        None => {
            tracing::warn!(
                "{TOKEN_SECRET_ENV} not set; using a random secret, tokens will not survive a restart"
            );
            TokenSecret::generate().map_err(ConfigError::InvalidSecret)
        }
    }
}

pub fn load_token_secret(require: bool) -> Result<TokenSecret, ConfigError> {
    token_secret_from(std::env::var(TOKEN_SECRET_ENV).ok(), require)
}
