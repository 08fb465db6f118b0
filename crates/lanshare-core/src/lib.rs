//! # Lanshare Core Library
//!
//! `lanshare-core` is the transfer engine behind Lanshare, a peer-to-peer
//! file sharing tool for local networks.
//!
//! ## Features
//!
//! - **Broadcast discovery**: peers announce themselves over UDP broadcast
//! - **Consent-based handshake**: the receiver approves every session
//! - **Parallel chunked transfers**: large files are split and pushed over
//!   independent TCP connections
//! - **Failure containment**: per-chunk retry with backoff and stall
//!   detection, clean session teardown on any terminal failure
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`discovery`] - Peer discovery via UDP broadcast
//! - [`handshake`] - Transfer request/accept exchange
//! - [`plan`] - Chunk planning for a file size
//! - [`ports`] - Per-chunk transfer port negotiation
//! - [`protocol`] - Wire protocol encoding and validation
//! - [`session`] - Engine lifecycle and orchestration
//! - [`transfer`] - Send/receive coordinators and chunk workers
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanshare_core::{Config, Engine};
//!
//! let engine = Engine::new(Config::default());
//! let mut peers = engine.start_discovery().await?;
//! let peer = peers.recv().await.expect("a peer showed up");
//!
//! if engine.request_connection(&peer, "alice", &files).await? {
//!     let mut events = engine.start_sending(&peer, files).await;
//!     while let Some(event) = events.recv().await { /* render it */ }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod plan;
pub mod ports;
pub mod protocol;
pub mod session;
pub mod transfer;

pub use config::Config;
pub use discovery::Peer;
pub use error::{Error, Result};
pub use handshake::AcceptDecision;
pub use session::Engine;
pub use transfer::TransferEvent;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Discovery port (UDP broadcast)
pub const DEFAULT_DISCOVERY_PORT: u16 = 9000;

/// Handshake port (TCP)
pub const DEFAULT_HANDSHAKE_PORT: u16 = 9080;

/// Transfer base port (TCP); chunk `i` defaults to `base + 1 + i`
pub const DEFAULT_TRANSFER_PORT: u16 = 9090;

/// Dynamic port range searched when a default chunk port is taken
pub const DYNAMIC_PORT_RANGE: std::ops::Range<u16> = 50000..60000;

/// Maximum attempts when searching the dynamic port range
pub const MAX_PORT_ATTEMPTS: usize = 100;

/// Files below this size are sent as a single chunk (64 MiB); it is also
/// the chunk size floor for larger files
pub const BASE_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Chunk size ceiling (256 MiB)
pub const MAX_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Upper bound on chunks per file regardless of parallelism
pub const MAX_CHUNKS: u32 = 16;

/// Concurrent chunk transfers per file
pub const DEFAULT_PARALLEL_CHUNKS: usize = 4;

/// Per-chunk send attempts before the file fails
pub const DEFAULT_CHUNK_RETRIES: u32 = 3;

/// Maximum filename length accepted in a file header
pub const MAX_NAME_LENGTH: u32 = 1024;
