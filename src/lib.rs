//! # tor-fleet
//!
//! Manage a fleet of independently configured Tor client daemons.
//!
//! ## Features
//!
//! - **Reconciliation**: one record per `torrc` / `torrc.<n>` descriptor, merged with runtime state cached by the previous run and with live processes
//! - **Lifecycle**: start and stop daemons with a launch deadline and graceful termination
//! - **Identity rotation**: `SIGNAL NEWNYM` over the control port, with the resulting exit identity resolved through the client's SOCKS port
//! - **Addressing**: every operation takes a [`registry::Selector`] (socks/control port, list index, or exit label)
//! - **Descriptor management**: create and delete custom descriptors
//!
//! ## Quick Start
//!
//! ```no_run
//! use tor_fleet::config::Settings;
//! use tor_fleet::registry::{ClientRegistry, Selector};
//!
//! # async fn example() -> Result<(), tor_fleet::Error> {
//! let settings = Settings::load(None)?;
//! let registry = ClientRegistry::builder().settings(&settings).build().await?;
//!
//! registry.start(&Selector::label("de")).await?;
//! registry.rotate(&Selector::Port(9060)).await?;
//!
//! // Hand runtime state to the next run
//! registry.flush_all().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Registry methods take `&self`; each client has its own lock held for a
//!   whole transition, so operations on different clients run concurrently
//! - Batch operations (`start_all`, `stop_all`, `rotate_all`) fan out with
//!   `join_all` and report per-client failures
//! - In-flight launches can be cancelled via [`registry::ClientRegistry::cancel_operations`]

pub mod cache;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod identity;
pub mod registry;

pub use error::{Error, Result};
pub use registry::{ClientRegistry, Selector};
