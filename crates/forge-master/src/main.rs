// Entry point for the Forge master process: loads the configuration,
// wires the control-plane modules together and serves until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use forge_common::config::MasterConfig;
use forge_master::data_link;
use forge_master::dispatcher::Dispatcher;
use forge_master::event_router::EventRouter;
use forge_master::handlers::{
    BinaryIngest, LogHandler, LogRegisterHandler, ResponseHandler, TransferRegistry,
    WscNotifyHandler,
};
use forge_master::job_master::JobMaster;
use forge_master::log_sink::LogSink;
use forge_master::pdb::PersistentStore;
use forge_master::records::RecordStore;
use forge_master::storage::Storage;
use forge_master::tracker::TaskTracker;
use forge_master::worker_room::WorkerRoom;

#[derive(Parser, Debug)]
#[command(name = "forge-master", about = "Forge build orchestrator master")]
struct Args {
    /// Control-plane listen address.
    address: String,
    /// Control-plane listen port.
    port: u16,
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

    let config = Arc::new(MasterConfig::load(&args.config)?);
    tracing::info!("forge master starting on {}:{}", args.address, args.port);

    // Persistence.
    let records = RecordStore::open(&config.record_dir)?;
    let pdb = Arc::new(PersistentStore::open(config.pdb_dir.clone(), records.clone()).await?);
    let storage = Arc::new(Storage::new(&config.storage_dir)?);
    let log_sink = Arc::new(LogSink::new(&config.log_dir)?);
    let finished = TransferRegistry::new();

    // Control plane.
    let router = EventRouter::new();
    let room = WorkerRoom::new(Duration::from_secs(config.waiting_interval), router.clone());
    let tracker = Arc::new(TaskTracker::new());

    let (notify_tx, notify_rx) = mpsc::channel(256);
    let dispatcher = Dispatcher::new(tracker.clone(), room.clone(), notify_tx);

    let (dispatch_tx, dispatch_rx) = mpsc::channel(256);
    let job_master = JobMaster::new(config.clone(), records, pdb.clone(), dispatch_tx);

    let ingest = BinaryIngest::new(storage, finished.clone());
    router.register(
        "response",
        ResponseHandler::new(
            dispatcher.clone(),
            job_master.clone(),
            finished,
            config.result_dir.clone(),
        ),
    );
    router.register("log", LogHandler::new(log_sink.clone()));
    router.register("logRegister", LogRegisterHandler::new(log_sink));
    router.register("binary", ingest.clone());
    router.register("Notify", WscNotifyHandler::new(room.clone()));

    let cancel = CancellationToken::new();

    // Long-running loops.
    let control = TcpListener::bind((args.address.clone(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.address, args.port))?;
    tokio::spawn(room.clone().run_listener(control, cancel.clone()));
    tokio::spawn(room.clone().run_maintain(cancel.clone()));

    tokio::spawn(dispatcher.clone().run(cancel.clone()));
    tokio::spawn(dispatcher.clone().run_endpoint(dispatch_rx, cancel.clone()));
    tokio::spawn(
        dispatcher
            .clone()
            .run_room_events(room.subscribe(), cancel.clone()),
    );
    tokio::spawn(job_master.clone().run_notify(notify_rx, cancel.clone()));

    let data = TcpListener::bind((args.address.clone(), config.data_port))
        .await
        .with_context(|| format!("failed to bind data port {}", config.data_port))?;
    tokio::spawn(data_link::run_binary_listener(data, ingest, cancel.clone()));

    if config.log_port != 0 {
        let udp = UdpSocket::bind((args.address.clone(), config.log_port))
            .await
            .with_context(|| format!("failed to bind log port {}", config.log_port))?;
        tokio::spawn(data_link::run_task_log_intake(udp, pdb, cancel.clone()));
    }

    // Replay jobs left over from a previous run.
    job_master.recover().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    Ok(())
}
