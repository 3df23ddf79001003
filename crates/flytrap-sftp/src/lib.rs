//! # Flytrap SFTP
//!
//! An SFTP honeypot. It speaks SSH and SFTP v3 convincingly enough for
//! automated scanners and scripted attackers to log in and work with what
//! looks like a real filesystem, while nothing they upload is stored and
//! nothing they download is real.
//!
//! Every password attempt and every file operation is recorded:
//! - an append-only activity log, one line per action
//! - a JSON snapshot of every (ip, user) pair seen, with the passwords tried
//!
//! Both are flushed to disk on a fixed cadence by a background task.
//!
//! ## Layout
//!
//! - [`server`]: SSH transport, authentication and channel plumbing
//! - [`sftp`]: SFTP request loop
//! - [`decoy_fs`]: the fake filesystem behind every session
//! - [`auth`]: per-attempt login policy
//! - [`recorder`]: buffered telemetry and its flush task

pub mod auth;
pub mod catalog;
pub mod config;
pub mod connection_tracker;
pub mod decoy_fs;
pub mod error;
pub mod handlers;
pub mod listing;
pub mod protocol;
pub mod recorder;
pub mod records;
pub mod server;
pub mod sftp;

pub use auth::AuthGate;
pub use catalog::{CatalogEntry, SyntheticEntry};
pub use config::{Config, LogFormat};
pub use connection_tracker::{ConnectionSlot, ConnectionTracker, ConnectionTrackerConfig};
pub use decoy_fs::DecoyFs;
pub use error::{Error, Result};
pub use handlers::{ContentReader, DiscardWriter, FileHandlers, Method, Request};
pub use listing::{Listing, Page};
pub use recorder::{FlushReport, Recorder};
pub use records::{ActivityRecord, IdentityRecord};
pub use server::Server;
