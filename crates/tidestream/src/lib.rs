//! # tidestream - CDC event streaming for TimescaleDB
//!
//! tidestream subscribes to PostgreSQL logical replication (pgoutput),
//! reconstructs row-level events for a selected set of TimescaleDB
//! hypertables, optionally performs a consistent initial snapshot
//! fenced by low/high watermarks, and publishes Debezium-style
//! envelopes to pluggable sinks.
//!
//! ## Architecture
//!
//! ```text
//! PostgreSQL WAL ──► ReplicationChannel ──► PgOutputDecoder
//!                                               │
//!                       LogicalReplicationResolver ──► Dispatcher ──► EventEmitter ──► Sinks
//!                          │            ▲
//!                          ▼            │ watermark windows
//!                    SystemCatalog   Snapshotter ◄── SideChannel (catalog, snapshots)
//! ```
//!
//! The replication channel consumes the WAL on a dedicated replication
//! connection; the side channel answers catalog queries and runs the
//! batched snapshot reads on a regular connection. Everything that
//! emits runs on the single dispatcher task, which is what makes event
//! order per replication slot strict.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tidestream::{Config, ExtensionPoints, Streamer};
//!
//! # async fn example() -> tidestream::Result<()> {
//! let config = Config::from_yaml(
//!     "postgresql:\n  connection: \"postgres://repl@localhost/tsdb\"\n",
//! )?;
//! let streamer = Streamer::new(config, ExtensionPoints::new())?;
//! streamer.start().await?;
//! streamer.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod emit;
pub mod error;
pub mod event;
pub mod pgtypes;
pub mod plugin;
pub mod replication;
pub mod schema;
pub mod sidechannel;
pub mod sink;
pub mod snapshot;
pub mod state;
pub mod streamer;
pub mod typeres;

pub use config::{Config, InitialSnapshotMode};
pub use error::{Result, StreamerError};
pub use event::{ChangeEvent, MessageEvent, Op};
pub use pgtypes::Lsn;
pub use plugin::ExtensionPoints;
pub use streamer::{StartOutcome, Streamer};
