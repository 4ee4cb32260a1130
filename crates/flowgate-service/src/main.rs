use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgate_common::consts;
use flowgate_common::proto::Source;
use flowgate_service::{ServiceConfig, ServiceState};
use flowgate_store::{AuditEntry, AuditEvent};

#[derive(Debug, Parser)]
#[command(
    name = "flowgated",
    version,
    about = "Flowgate policy service: reconciles declarative firewall policy into the platform filtering engine"
)]
struct Args {
    /// Service configuration file (JSON); defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for LKG, audit log, history and the control socket.
    #[arg(long, default_value = consts::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = ServiceConfig::load(args.config.as_deref()).context("loading configuration")?;

    let backend = engine_backend();
    let state = ServiceState::new(config, args.data_dir, backend)
        .context("constructing service state")?;

    state
        .audit
        .append(&AuditEntry::new(AuditEvent::ServiceStart, Source::Startup));
    state.apply_lkg_on_startup().await;

    let listener = state.bind_endpoint().context("binding control endpoint")?;
    let serve = flowgate_service::ipc::server::serve(listener, Arc::clone(&state));

    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                warn!(?err, "IPC server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    state
        .audit
        .append(&AuditEntry::new(AuditEvent::ServiceStop, Source::Startup));
    let _ = std::fs::remove_file(state.socket_path());
    info!("service stopped");
    Ok(())
}

/// The real engine on the reference host; the in-memory engine everywhere
/// else, which keeps development hosts and CI functional end to end.
fn engine_backend() -> Arc<dyn flowgate_wfp::EngineBackend> {
    #[cfg(all(windows, feature = "platform"))]
    {
        Arc::new(flowgate_wfp::platform::PlatformBackend)
    }
    #[cfg(not(all(windows, feature = "platform")))]
    {
        Arc::new(flowgate_wfp::memory::MemoryBackend::new())
    }
}
