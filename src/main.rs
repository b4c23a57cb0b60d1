//! keywatch: API key health monitor daemon.
//!
//! Keeps an encrypted registry of API keys, probes each one against its
//! service on a fixed interval, and records every outcome. Clients talk to
//! it over a Unix socket with JSON-RPC.
//!
//! Security:
//! - Keys encrypted at rest (AES-256-GCM + Argon2id)
//! - Master key from KEYWATCH_MASTER_KEY or a 0600 key file
//! - Socket restricted to the owning user
//! - Keys never cross the socket boundary

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

mod adapters;
mod config;
mod monitor;
mod server;
mod vault;

use adapters::AdapterRegistry;
use config::{LogFormat, Settings};
use monitor::scheduler::Scheduler;
use monitor::HealthMonitor;
use vault::store::KeyStore;

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keywatch=info".into()),
        )
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    init_tracing(settings.log_format);

    info!("🔭 keywatch v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("Failed to create data dir {}", settings.data_dir.display()))?;

    // ── Key Store ───────────────────────────────────────────────────
    let store = {
        let passphrase = settings.master_passphrase().context("Failed to load master key")?;
        Arc::new(KeyStore::open(&settings.db_path(), passphrase.as_bytes()).context("Failed to open key store")?)
    };

    let key_count = store.count().unwrap_or(0);
    if key_count == 0 {
        info!("📦 Vault is empty — add keys via: kw.keys.add");
        info!("   Example: {{\"jsonrpc\":\"2.0\",\"method\":\"kw.keys.add\",\"params\":{{\"service\":\"openai\",\"name\":\"prod\",\"secret\":\"sk-...\"}},\"id\":1}}");
    } else {
        info!("📦 Vault contains {} key(s)", key_count);
    }

    // ── Probes + Monitor ────────────────────────────────────────────
    let adapters = Arc::new(AdapterRegistry::with_defaults().context("Failed to build HTTP client")?);
    let monitor = Arc::new(HealthMonitor::new(store.clone(), store.clone(), adapters));

    // ── Scheduler ───────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&monitor), settings.scheduler_config()));
    scheduler.start().context("Failed to start scheduler")?;

    // ── JSON-RPC Server ─────────────────────────────────────────────
    let socket_path = settings.socket_path();
    let srv = server::Server::new(socket_path.clone(), monitor, Arc::clone(&scheduler));

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("keywatch daemon ready");

    let served = tokio::select! {
        result = srv.run() => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            Ok(())
        }
    };

    scheduler.shutdown().await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("Failed to remove socket {}: {}", socket_path.display(), e);
        }
    }

    served
}
