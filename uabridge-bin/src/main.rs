mod logging;

use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uabridge_engine::{ConfigPersist, OpcEngine};
use uabridge_error::BridgeResult;
use uabridge_model::ConfigStore;
use uabridge_supervisor::{
    Batcher, BatcherSink, Dispatcher, ProgressForwarder, SupervisorLink, TransIdGen,
};

/// OPC UA to SCADA supervisor bridging driver.
///
/// Connects to the supervisor over a persistent line-delimited JSON socket
/// and translates its commands into OPC UA sessions, subscriptions and
/// monitored items, streaming value changes back as asynchronous frames.
#[derive(Parser)]
#[command(name = "uabridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "OPC UA supervisor bridge", long_about = None)]
struct Cli {
    /// Path to the JSON configuration document
    #[arg(short, long, env = "UABRIDGE_CONFIG", default_value = "bridge.json")]
    config: PathBuf,
}

/// Persists the configuration after a successful browse population.
struct StorePersist {
    store: ConfigStore,
}

impl ConfigPersist for StorePersist {
    fn persist(&self) -> BridgeResult<()> {
        self.store.save()
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> BridgeResult<()> {
    let cli = Cli::parse();
    let store = ConfigStore::load(&cli.config)?;
    let driver = store.driver_settings();
    let _log_guard = logging::init(&driver.log_level)?;
    info!(config = %cli.config.display(), "uabridge starting");

    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (change_tx, change_rx) = mpsc::unbounded_channel();
    let ids = Arc::new(TransIdGen::new());

    let progress = Arc::new(ProgressForwarder::new(out_tx.clone()));
    let persist = Arc::new(StorePersist {
        store: store.clone(),
    });
    let engine = OpcEngine::new(
        store,
        Arc::new(BatcherSink::new(change_tx)),
        progress,
        persist,
        cancel.child_token(),
    );

    tokio::spawn(
        Batcher::new(change_rx, out_tx.clone(), Arc::clone(&ids), cancel.child_token()).run(),
    );

    let dispatcher = Arc::new(Dispatcher::new(engine, ids, out_tx));
    let link = SupervisorLink::new(driver, dispatcher, out_rx, cancel.child_token());
    let link_task = tokio::spawn(link.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = link_task.await;
    Ok(())
}
