use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::io::{stderr, stdin, IsTerminal, Write};
use tokio::sync::Mutex;

/// Environment variable holding the control password for non-interactive use.
pub const CONTROL_PASSWORD_ENV: &str = "TOR_FLEET_CONTROL_PASSWORD";

/// A plaintext control password. Held in memory only; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Obtain the control password for the client on SOCKS `port`.
    async fn obtain(&self, port: u16) -> Result<Secret>;
}

/// Reads the password from `TOR_FLEET_CONTROL_PASSWORD`.
#[derive(Debug, Default)]
pub struct EnvSecretSource;

#[async_trait]
impl SecretSource for EnvSecretSource {
    async fn obtain(&self, port: u16) -> Result<Secret> {
        match std::env::var(CONTROL_PASSWORD_ENV) {
            Ok(value) if !value.is_empty() => Ok(Secret::new(value)),
            _ => Err(Error::Auth {
                port,
                reason: format!("{} is not set", CONTROL_PASSWORD_ENV),
            }),
        }
    }
}

/// Check if running in an interactive terminal.
pub fn is_interactive() -> bool {
    if std::env::var_os("TOR_FLEET_NON_INTERACTIVE").is_some() {
        return false;
    }
    stdin().is_terminal() && stderr().is_terminal()
}

/// Asks on the terminal without echoing.
///
/// Prompts are serialized, so concurrent rotations never interleave them.
#[derive(Debug, Default)]
pub struct PromptSecretSource {
    prompt_lock: Mutex<()>,
}

impl PromptSecretSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretSource for PromptSecretSource {
    async fn obtain(&self, port: u16) -> Result<Secret> {
        if !is_interactive() {
            return Err(Error::Auth {
                port,
                reason: format!(
                    "no terminal to prompt for the control password; set {}",
                    CONTROL_PASSWORD_ENV
                ),
            });
        }
        let _guard = self.prompt_lock.lock().await;
        let read = tokio::task::spawn_blocking(move || read_hidden(port))
            .await
            .map_err(|e| Error::Auth {
                port,
                reason: format!("prompt task failed: {}", e),
            })?;
        read.map_err(|e| Error::Auth {
            port,
            reason: format!("could not read password: {}", e),
        })?
        .map(Secret::new)
        .ok_or_else(|| Error::Auth {
            port,
            reason: "password entry cancelled".to_string(),
        })
    }
}

/// Read a line from the terminal in raw mode. `Ok(None)` when the user
/// pressed Esc or Ctrl-C.
fn read_hidden(port: u16) -> std::io::Result<Option<String>> {
    use crossterm::event::{read, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
    use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

    let mut err = stderr();
    write!(err, "Control password for client {}: ", port)?;
    err.flush()?;

    enable_raw_mode()?;
    let mut entered = String::new();
    let outcome = loop {
        let event = match read() {
            Ok(event) => event,
            Err(e) => break Err(e),
        };
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event
        else {
            continue;
        };
        if kind == KeyEventKind::Release {
            continue;
        }
        match code {
            KeyCode::Enter => break Ok(Some(std::mem::take(&mut entered))),
            KeyCode::Esc => break Ok(None),
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => break Ok(None),
            KeyCode::Backspace => {
                entered.pop();
            }
            KeyCode::Char(c) => entered.push(c),
            _ => {}
        }
    };
    disable_raw_mode()?;
    writeln!(err)?;
    outcome
}

/// Tries the environment first, then the terminal prompt.
pub struct FallbackSecretSource {
    env: EnvSecretSource,
    prompt: PromptSecretSource,
}

impl FallbackSecretSource {
    pub fn new() -> Self {
        Self {
            env: EnvSecretSource,
            prompt: PromptSecretSource::new(),
        }
    }
}

impl Default for FallbackSecretSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretSource for FallbackSecretSource {
    async fn obtain(&self, port: u16) -> Result<Secret> {
        match self.env.obtain(port).await {
            Ok(secret) => Ok(secret),
            Err(_) => self.prompt.obtain(port).await,
        }
    }
}
