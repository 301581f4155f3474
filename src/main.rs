//! txconsole - distributed transaction session console
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Console frontend / operators (HTTP)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Console Router                          │
//! │          (axum, JSON envelope, parameter parsing)           │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │      Query Engine        │ │      Command Processor         │
//! │ (filters, pagination)    │ │ (state machine legality, audit)│
//! └──────────────────────────┘ └────────────────────────────────┘
//!                    │                   │
//!                    └─────────┬─────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Session Store                           │
//! │      (per-xid locks, WAL, snapshot, crash recovery)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     File System                             │
//! │           (sessions.wal, sessions.snapshot.json)            │
//! └─────────────────────────────────────────────────────────────┘

use clap::Parser;
use log::info;

use txconsole::{Args, Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(&args)?;

    info!("Starting txconsole...");
    let server = Server::new(config)?;
    server.run().await?;
    Ok(())
}
