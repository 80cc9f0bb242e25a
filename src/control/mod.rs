//! Authenticated command channel to a running daemon.
//!
//! - `ControlChannel` / `ControlConnector` - traits the registry talks to
//! - `TcpControlConnector` - Tor control protocol over TCP
//! - `secret` - where the plaintext control password comes from

mod secret;
mod tor;

pub use secret::{
    is_interactive, EnvSecretSource, FallbackSecretSource, PromptSecretSource, Secret,
    SecretSource, CONTROL_PASSWORD_ENV,
};
pub use tor::{TcpControlConnector, TorControlChannel};

use crate::error::Result;
use async_trait::async_trait;

/// Signals the manager sends to a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Switch to clean circuits, giving the client a new exit identity.
    Rotate,
}

impl Signal {
    /// Keyword used on the wire.
    pub fn keyword(&self) -> &'static str {
        match self {
            Signal::Rotate => "NEWNYM",
        }
    }
}

#[async_trait]
pub trait ControlChannel: Send {
    /// Authenticate with the plaintext control password. Fails with
    /// `Error::Auth` when the daemon rejects it.
    async fn authenticate(&mut self, secret: &Secret) -> Result<()>;

    /// Send a signal. Fails with `Error::Channel` on any non-OK reply.
    async fn signal(&mut self, signal: Signal) -> Result<()>;
}

#[async_trait]
pub trait ControlConnector: Send + Sync {
    /// Open a channel to the daemon serving SOCKS `port` whose control
    /// listener is `control_port`.
    async fn connect(&self, port: u16, control_port: u16) -> Result<Box<dyn ControlChannel>>;
}
