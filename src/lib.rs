//! Streaming gateway in front of a P2P engine's control port.
//!
//! HTTP clients ask for content by id or transport URL; the gateway drives one
//! engine session per content key, shares it across clients, and relays the
//! engine's playback stream back to each of them.

pub mod config;
pub mod engine;
pub mod error;
pub mod plugin;
pub mod relay;
pub mod server;
pub mod source;

use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Install the fmt subscriber once; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("gateway tracing initialized");
    });
}
