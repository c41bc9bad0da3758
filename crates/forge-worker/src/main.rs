// Entry point for the Forge worker process: connect to the master,
// install the processing units matching the configured role and serve
// until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use forge_common::config::WorkerConfig;
use forge_common::letter::WorkerRole;
use forge_worker::channel::Channel;
use forge_worker::connector::Connector;
use forge_worker::job_unit::{JobProcUnit, JOB_UNIT_IDENT};
use forge_worker::post_unit::{PostProcUnit, POST_UNIT_IDENT};
use forge_worker::processor::{Processor, UnitMaintainer};

#[derive(Parser, Debug)]
#[command(name = "forge-worker", about = "Forge build orchestrator worker")]
struct Args {
    /// YAML configuration file.
    config: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Arc::new(WorkerConfig::load(&args.config)?);

    let ident = if config.worker_name.is_empty() {
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "worker".to_string())
    } else {
        config.worker_name.clone()
    };
    tracing::info!("forge worker '{ident}' starting (role {})", config.role);

    std::fs::create_dir_all(&config.build_dir)
        .with_context(|| format!("build dir {:?} not creatable", config.build_dir))?;
    std::fs::create_dir_all(&config.post_dir)
        .with_context(|| format!("post dir {:?} not creatable", config.post_dir))?;

    let (req_tx, req_rx) = mpsc::channel(4096);
    let connector = Connector::new(config.clone(), ident.clone(), req_tx).await?;

    let mut channel = Channel::new(256);
    let reports = channel.take_receiver();

    let mut processor = Processor::new(ident.clone(), connector.clone());

    let job_unit = JobProcUnit::new(
        config.clone(),
        connector.clone(),
        ident.clone(),
        channel.entry(JOB_UNIT_IDENT),
    );
    processor.install_unit(job_unit);
    processor.dispatch_to("new", JOB_UNIT_IDENT);

    if config.role == WorkerRole::Merger {
        let post_unit = PostProcUnit::new(
            config.clone(),
            connector.clone(),
            ident.clone(),
            channel.entry(POST_UNIT_IDENT),
        );
        processor.install_unit(post_unit);
        processor.dispatch_to("Post", POST_UNIT_IDENT);
        processor.dispatch_to("binary", POST_UNIT_IDENT);
    }

    let maintainer = UnitMaintainer::new(processor.units(), connector.clone(), ident.clone());

    let cancel = CancellationToken::new();
    tokio::spawn(connector.clone().run_control_link(cancel.clone()));
    tokio::spawn(processor.run(req_rx, cancel.clone()));
    tokio::spawn(maintainer.run(reports, cancel.clone()));

    // The merger listens for the fragment streams its siblings send.
    if config.role == WorkerRole::Merger {
        let merger = config
            .merger_address
            .as_ref()
            .context("a MERGER worker needs MERGER_ADDRESS for its data listener")?;
        let listener = TcpListener::bind(("0.0.0.0", merger.data_port))
            .await
            .with_context(|| format!("failed to bind data port {}", merger.data_port))?;
        tokio::spawn(connector.clone().run_data_listener(listener, cancel.clone()));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    Ok(())
}
