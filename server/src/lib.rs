//! # Scoreboard Sync Server Library
//!
//! This library provides the authoritative synchronization core for shared
//! tabletop scoreboards. It tracks which users are online, owns the canonical
//! scoring sessions, and fans every accepted change out to the channels that
//! follow the affected session.
//!
//! ## Core Responsibilities
//!
//! ### Presence Tracking
//! Users register with a client-chosen uid. When their channel drops they are
//! probed with a `ping` event; a user that does not answer with `pong` within
//! one probe interval is evicted from the active set.
//!
//! ### Session Ownership
//! Every scoring session lives in server memory and is identified by a
//! generated game id. Rosters, scoring marks and the undo history are only
//! ever changed here; clients receive full snapshots after each change.
//!
//! ### Broadcasting
//! Presence summaries and probes go to every open channel (the lobby).
//! Session snapshots go to the room of that session only.
//!
//! ## Architecture Design
//!
//! ### Single-Owner Event Loop
//! One task owns the [`context::SyncContext`] and applies channel events, sweep
//! timer expiries and persistence failures strictly one at a time. Channel
//! tasks only parse and forward; no registry is ever shared behind a lock.
//!
//! ### WebSocket Transport
//! Clients talk JSON text frames over WebSocket. Every frame is an object
//! `{"event": <name>, "data": <payload>}` using the event names of the
//! [`shared`] crate.
//!
//! ### Write-Behind Persistence
//! Session mutations are queued to a background worker that writes snapshot
//! files with bounded retry. Broadcasting never waits for the disk.
//!
//! ## Module Organization
//!
//! - `presence`: active, connected and probed user sets with reconciliation
//! - `sweep`: the single coalescing deadline driving reconciliation
//! - `session`: session registry, roster rebuilds, scoring and undo
//! - `broadcast`: channel registry with lobby and per-session rooms
//! - `persistence`: snapshot queue, retry worker and file store
//! - `context`: the core tying the registries together
//! - `network`: WebSocket acceptor and the core loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::context::SyncContext;
//! use server::network::Server;
//! use server::persistence::PersistenceBridge;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let context = SyncContext::new(&config, PersistenceBridge::disabled());
//!
//!     let mut server = Server::bind("127.0.0.1:3000", context, None).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod context;
pub mod error;
pub mod network;
pub mod persistence;
pub mod presence;
pub mod session;
pub mod sweep;
