//! Slot-based serving of local GGUF models.
//!
//! A routing [`proxy`] fronts one backend process per accelerator slot. The
//! [`supervisor`] owns those processes; each runs the [`backend`] service around a
//! [`handle::GenerationHandle`], which drives an [`engine::NativeEngine`] and hands
//! streamed tokens to the HTTP layer through the [`bridge`].

pub mod backend;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod model_catalog;
pub mod overrides;
pub mod prompting;
pub mod proxy;
pub mod registry;
pub mod supervisor;

use tokio::signal;
use tracing::{info, warn};

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
