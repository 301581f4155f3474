use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;

pub mod command;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod error;
pub mod query;
pub mod row_lock;
pub mod state;
pub mod store;
pub mod sweep;
pub mod types;

pub use crate::command::{CommandProcessor, CommitOrRollback};
pub use crate::config::{Args, Config};
pub use crate::console::{router, ConsoleState};
pub use crate::coordinator::{BranchRegistration, Coordinator};
pub use crate::error::{ConsoleError, ErrorKind, Result};
pub use crate::query::{GlobalSessionFilter, Page, PageRequest, QueryEngine};
pub use crate::row_lock::{GlobalLockFilter, LockTarget, RowLock};
pub use crate::state::{BranchStatus, GlobalStatus};
pub use crate::store::{SessionStore, StoreConfig};
pub use crate::sweep::Sweeper;
pub use crate::types::{BranchSession, BranchType, GlobalSession};

/// The console server: session store, retention sweeper and HTTP surface
pub struct Server {
    config: Config,
    store: Arc<SessionStore>,
    query: Arc<QueryEngine>,
    commands: Arc<CommandProcessor>,
    coordinator: Arc<Coordinator>,
}

impl Server {
    /// Open (and recover) the session store
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(SessionStore::open(config.data_dir.clone(), config.store_config())?);
        let query = Arc::new(QueryEngine::new(Arc::clone(&store), config.max_page_size));
        let commands = Arc::new(CommandProcessor::new(Arc::clone(&store)));
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&store), config.bind_addr.to_string()));
        Ok(Self { config, store, query, commands, coordinator })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Protocol-side handle for the live coordination path.
    ///
    /// The binary serves only the console; an embedding transaction server
    /// drives begin, registration and status reports through this handle and
    /// the console sees the results in the shared store.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> axum::Router {
        console::router(ConsoleState::new(Arc::clone(&self.query), Arc::clone(&self.commands)))
    }

    /// Serve until ctrl-c, then stop the sweeper and checkpoint the store
    pub async fn run(&self) -> Result<()> {
        let mut sweeper = Sweeper::spawn(Arc::clone(&self.store), self.config.sweep_config())?;

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("txconsole listening on {}", self.config.bind_addr);
        info!("Data directory: {:?}", self.config.data_dir);

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await;

        sweeper.stop();
        let store = Arc::clone(&self.store);
        let closed = tokio::task::spawn_blocking(move || store.shutdown())
            .await
            .map_err(|e| ConsoleError::Internal(format!("shutdown task failed: {}", e)))?;
        if let Err(e) = &closed {
            error!("Session store shutdown failed: {}", e);
        }

        served?;
        closed
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
