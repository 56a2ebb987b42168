//! Identity reconciliation gRPC server.
//!
//! A standalone server binary serving `IdentityService` over gRPC.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use identity_reconciler::config::ServiceConfig;
use identity_reconciler::storage::{open_database, ContactStore, InMemoryContactStore, PersistentContactStore};
use identity_reconciler::transport::IdentityServiceImpl;
use identity_reconciler::{IdentityResolver, ResolverRuntime};

#[derive(Parser, Debug)]
#[command(name = "identity-server")]
#[command(about = "Identity reconciliation gRPC server")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(short, long, value_name = "FILE", env = "IDENTITY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, value_name = "ADDR", env = "IDENTITY_LISTEN")]
    listen: Option<SocketAddr>,

    /// Database directory (overrides the config file)
    #[arg(short, long, value_name = "DIR", conflicts_with = "in_memory")]
    data_dir: Option<PathBuf>,

    /// Keep contacts in memory only, ignoring any configured data directory
    #[arg(long)]
    in_memory: bool,

    /// Number of resolver worker threads (overrides the config file)
    #[arg(short, long)]
    workers: Option<usize>,
}

impl Cli {
    fn into_config(self) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = Some(dir);
        }
        if self.in_memory {
            config.data_dir = None;
        }
        if let Some(workers) = self.workers {
            config.runtime.workers = workers;
        }
        Ok(config.validate()?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config()?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting identity server");

    // Holds the directory lock for the process lifetime.
    let persistent: Option<Arc<PersistentContactStore>> = match &config.data_dir {
        Some(dir) => {
            let store = open_database(dir, Some(config.storage.clone()))?;
            tracing::info!(
                data_dir = %store.dir().display(),
                contacts = store.len()?,
                "opened contact database"
            );
            Some(Arc::new(store))
        }
        None => {
            tracing::warn!("no data directory configured; contacts are kept in memory only");
            None
        }
    };
    let store: Arc<dyn ContactStore> = match &persistent {
        Some(store) => Arc::clone(store) as Arc<dyn ContactStore>,
        None => Arc::new(InMemoryContactStore::new()),
    };

    let resolver = IdentityResolver::with_policy(store, config.input.clone());
    tracing::debug!(policy = ?resolver.policy(), "input policy");
    let runtime = Arc::new(ResolverRuntime::new(resolver, &config.runtime)?);
    let svc = IdentityServiceImpl::new(Arc::clone(&runtime), config.request_timeout()).into_server();

    tracing::info!(
        addr = %config.listen_addr,
        workers = config.runtime.workers,
        "serving gRPC; press Ctrl+C to stop"
    );
    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(config.listen_addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    // Joins the workers once the last in-flight request releases its reference.
    drop(runtime);

    if let Some(store) = persistent {
        match store.compact() {
            Ok(result) => tracing::info!(contacts = result.contacts_compacted, "compacted on shutdown"),
            Err(e) => tracing::warn!(error = %e, "compaction on shutdown failed"),
        }
    }
    tracing::info!("shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn listen_address_can_come_from_the_environment() {
        let cmd = Cli::command();
        let listen = cmd
            .get_arguments()
            .find(|arg| arg.get_id() == "listen")
            .unwrap();
        assert_eq!(listen.get_env(), Some(std::ffi::OsStr::new("IDENTITY_LISTEN")));
    }

    #[test]
    fn flags_override_the_defaults() {
        let config = Cli::try_parse_from(["identity-server", "--listen", "0.0.0.0:8080", "--workers", "2"])
            .unwrap()
            .into_config()
            .unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.runtime.workers, 2);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn data_dir_conflicts_with_in_memory() {
        assert!(Cli::try_parse_from(["identity-server", "--data-dir", "/tmp/x", "--in-memory"]).is_err());
    }
}
