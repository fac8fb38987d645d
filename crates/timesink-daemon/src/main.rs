// Copyright [2026] [Joseph Verdicchio]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use timesink_core::engine::MemoryProgressStore;
use timesink_core::recording::FsBlobSink;
use timesink_core::{MazeCatalog, OsRandom, SystemClock};
use timesink_daemon::config::{load_token_secret, DaemonConfig};
use timesink_daemon::http::{bind_listener, serve, spawn_metrics_server, AppState};
use timesink_daemon::journal::{JournalArtifactStore, NdjsonJournal};
use timesink_daemon::runtime::{MazeRuntime, RuntimeParts};
use timesink_daemon::telemetry::Telemetry;

#[derive(Debug, Parser)]
#[command(name = "timesink-daemon")]
#[command(about = "Timesink maze session daemon")]
struct Args {
    /// Overrides TIMESINK_LISTEN.
    #[arg(long)]
    listen: Option<String>,

    /// Serve /metrics on a separate address as well.
    #[arg(long)]
    metrics_listen: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory of JSON maze definitions published next to the built-ins.
    #[arg(long)]
    maze_dir: Option<PathBuf>,

    /// Refuse to start without TIMESINK_TOKEN_SECRET.
    #[arg(long)]
    require_secret: bool,

    /// Make every step token single use.
    #[arg(long)]
    single_use_tokens: bool,

    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let mut cfg = DaemonConfig::from_env();
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if args.metrics_listen.is_some() {
        cfg.metrics_listen = args.metrics_listen;
    }
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }
    if args.maze_dir.is_some() {
        cfg.maze_dir = args.maze_dir;
    }
    cfg.tokens.single_use |= args.single_use_tokens;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let secret = load_token_secret(args.require_secret)?;

    let mut catalog = MazeCatalog::with_builtin_templates()?;
    if let Some(dir) = &cfg.maze_dir {
        let loaded = catalog.load_dir(dir)?;
        tracing::info!(maze_dir = %dir.display(), loaded, "custom mazes published");
    }
    tracing::info!(mazes = ?catalog.maze_ids(), "maze catalog ready");

    let journal = Arc::new(NdjsonJournal::new(cfg.data_dir.join("sessions.ndjson")));
    let artifacts = Arc::new(JournalArtifactStore::new(Arc::new(NdjsonJournal::new(
        cfg.data_dir.join("artifacts.ndjson"),
    ))));
    let telemetry = Arc::new(Telemetry::new());
    let parts = RuntimeParts {
        catalog: Arc::new(catalog),
        clock: Arc::new(SystemClock),
        rng: Arc::new(OsRandom),
        secret,
        progress: Arc::new(MemoryProgressStore::new()),
        blobs: Arc::new(FsBlobSink::new(cfg.data_dir.join("blobs"))),
        artifacts,
        journal: Some(journal),
    };
    let runtime = Arc::new(MazeRuntime::new(&cfg, parts, telemetry.clone()));

    if let Some(addr) = &cfg.metrics_listen {
        let listener = bind_listener(addr).await?;
        spawn_metrics_server(listener, telemetry.clone());
        tracing::info!(addr = %addr, "metrics listener started");
    }

    let sweeper = {
        let runtime = runtime.clone();
        let period = Duration::from_millis(cfg.cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let runtime = runtime.clone();
                let swept = tokio::task::spawn_blocking(move || runtime.cleanup_expired()).await;
                if let Err(err) = swept {
                    tracing::error!(error = %err, "expired-session sweep failed");
                }
            }
        })
    };

    let listener = bind_listener(&cfg.listen).await?;
    tracing::info!(
        addr = %cfg.listen,
        data_dir = %cfg.data_dir.display(),
        single_use_tokens = cfg.tokens.single_use,
        "starting timesink daemon"
    );

    let state = AppState {
        runtime: runtime.clone(),
        telemetry,
        max_body_bytes: cfg.max_body_bytes,
    };
    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await?;

    sweeper.abort();
    let sweep = tokio::task::spawn_blocking(move || runtime.flush_all_pending()).await?;
    tracing::info!(
        flushed = sweep.flushed,
        failed = sweep.failed.len(),
        "pending recordings flushed"
    );
    Ok(())
}
