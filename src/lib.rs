pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{AcceptedSession, SessionConfig, SessionSupervisor, Termination};

use job::{FormatEncoder, JobRunner, Pipelines, PreviewGenerator};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Serves the offer relay until the process is stopped.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let ice_servers = config.ice_servers()?;
    let addr = config.listen_addr()?;

    let runner = JobRunner::new(
        Pipelines::uniform(Arc::new(PreviewGenerator)),
        Arc::new(FormatEncoder::new(config.format)),
        config.output_mode(),
    );
    let supervisor = SessionSupervisor::new(config.session_config(), Arc::new(runner));
    let app = signaling::router(signaling::AppState::new(supervisor, ice_servers));

    let listener = TcpListener::bind(addr).await?;
    info!(
        addr = %listener.local_addr()?,
        mode = ?config.output_mode(),
        format = config.format.as_str(),
        idle_timeout_secs = config.idle_timeout_secs,
        "relay listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
