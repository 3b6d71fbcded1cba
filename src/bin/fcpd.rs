// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Run the FCP node as a standalone TCP daemon.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use fcp_node::config::FcpConfig;
use fcp_node::jobs::{DisabledJobRunner, JobRunner, SerialJobRunner};
use fcp_node::persist::{self, FileRequestStore};
use fcp_node::registry::ClientRegistry;
use fcp_node::request::{RecordingEngine, RequestEngine};
use fcp_node::server::FcpServer;
use fcp_node::usk::LocalUskService;
use fcp_node::Node;
use log::{error, info, warn, LevelFilter};

#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "FCP client protocol node", long_about = None)]
struct Args {
    /// TOML config file; defaults to $FCP_CONFIG.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = FcpConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if !config.enabled {
        warn!("FCP is disabled in the configuration");
        return Ok(());
    }

    let registry = Arc::new(ClientRegistry::new());
    let engine: Arc<dyn RequestEngine> = Arc::new(RecordingEngine::new());
    let mut runner = None;
    let jobs: Arc<dyn JobRunner> = match &config.persistence_file {
        Some(path) => {
            let store = FileRequestStore::new(path);
            let restored = persist::restore(&store, &registry, engine.as_ref())
                .with_context(|| format!("failed to restore {}", path.display()))?;
            info!("resumed {restored} forever requests");
            let checkpoint_registry = Arc::clone(&registry);
            let serial = Arc::new(
                SerialJobRunner::start(Some(Box::new(move || {
                    if let Err(err) = store.checkpoint(&checkpoint_registry) {
                        error!("checkpoint failed: {err}");
                    }
                })))
                .context("failed to start persistent job runner")?,
            );
            runner = Some((Arc::clone(&serial), path.clone()));
            serial
        }
        None => {
            warn!("no persistence_file configured; forever requests are refused");
            Arc::new(DisabledJobRunner)
        }
    };

    let node = Arc::new(Node::new(
        Arc::clone(&registry),
        jobs,
        engine,
        Arc::new(LocalUskService::new()),
        config.node_info(),
    ));
    let server = FcpServer::bind(config, Arc::clone(&node))?;
    server.serve()?;

    if let Some((runner, path)) = runner {
        runner.shutdown();
        FileRequestStore::new(&path)
            .checkpoint(&registry)
            .with_context(|| format!("final checkpoint to {} failed", path.display()))?;
        info!("final checkpoint written to {}", path.display());
    }
    Ok(())
}
