use super::{ControlChannel, ControlConnector, Secret, Signal};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Status code tor answers a rejected AUTHENTICATE with.
const BAD_AUTHENTICATION: u16 = 515;
/// Status code for commands sent before authenticating.
const AUTHENTICATION_REQUIRED: u16 = 514;

/// Opens control connections on the loopback interface.
pub struct TcpControlConnector {
    host: String,
    timeout: Duration,
}

impl TcpControlConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            timeout,
        }
    }

    pub fn with_host(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

impl Default for TcpControlConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ControlConnector for TcpControlConnector {
    async fn connect(&self, port: u16, control_port: u16) -> Result<Box<dyn ControlChannel>> {
        let addr = format!("{}:{}", self.host, control_port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Channel {
                port,
                reason: format!("connecting to {} timed out after {:?}", addr, self.timeout),
            })?
            .map_err(|e| Error::Channel {
                port,
                reason: format!("cannot connect to {}: {}", addr, e),
            })?;
        debug!("Opened control connection to {} for client {}", addr, port);
        Ok(Box::new(TorControlChannel::new(port, stream, self.timeout)))
    }
}

/// One reply from the daemon: final status code and the text of each line.
#[derive(Debug, PartialEq, Eq)]
struct Reply {
    status: u16,
    lines: Vec<String>,
}

impl Reply {
    fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn message(&self) -> String {
        format!("{} {}", self.status, self.lines.join(" | "))
    }
}

/// A connection speaking the line-based Tor control protocol.
pub struct TorControlChannel {
    port: u16,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl TorControlChannel {
    pub fn new(port: u16, stream: TcpStream, timeout: Duration) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            port,
            reader: BufReader::new(read_half),
            writer,
            timeout,
        }
    }

    fn channel_error(&self, reason: impl Into<String>) -> Error {
        Error::Channel {
            port: self.port,
            reason: reason.into(),
        }
    }

    async fn command(&mut self, line: &str) -> Result<Reply> {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .map_err(|e| self.channel_error(format!("write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| self.channel_error(format!("write failed: {}", e)))?;

        match tokio::time::timeout(self.timeout, self.read_reply()).await {
            Ok(reply) => reply,
            Err(_) => Err(self.channel_error(format!("no reply within {:?}", self.timeout))),
        }
    }

    /// Read `250-...` continuation lines up to the final `250 ...` line.
    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let mut raw = String::new();
            let read = self
                .reader
                .read_line(&mut raw)
                .await
                .map_err(|e| self.channel_error(format!("read failed: {}", e)))?;
            if read == 0 {
                return Err(self.channel_error("connection closed by daemon"));
            }
            let line = raw.trim_end_matches(['\r', '\n']);
            let (status, separator, text) = split_reply_line(line)
                .ok_or_else(|| self.channel_error(format!("malformed reply line {:?}", line)))?;
            lines.push(text.to_string());
            if separator == ' ' {
                return Ok(Reply { status, lines });
            }
        }
    }
}

/// Split `250-text` / `250 text` / `250+text` into its parts.
fn split_reply_line(line: &str) -> Option<(u16, char, &str)> {
    if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
        return None;
    }
    let status = line[..3].parse().ok()?;
    let separator = line[3..4].chars().next()?;
    if !matches!(separator, ' ' | '-' | '+') {
        return None;
    }
    Some((status, separator, &line[4..]))
}

/// Quote a password for `AUTHENTICATE "..."`.
fn quote(secret: &str) -> String {
    let mut quoted = String::with_capacity(secret.len() + 2);
    quoted.push('"');
    for c in secret.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[async_trait]
impl ControlChannel for TorControlChannel {
    async fn authenticate(&mut self, secret: &Secret) -> Result<()> {
        let reply = self
            .command(&format!("AUTHENTICATE {}", quote(secret.expose())))
            .await?;
        if reply.is_ok() {
            debug!("Client {} control channel authenticated", self.port);
            return Ok(());
        }
        Err(Error::Auth {
            port: self.port,
            reason: reply.message(),
        })
    }

    async fn signal(&mut self, signal: Signal) -> Result<()> {
        let reply = self
            .command(&format!("SIGNAL {}", signal.keyword()))
            .await?;
        if reply.is_ok() {
            return Ok(());
        }
        if reply.status == AUTHENTICATION_REQUIRED || reply.status == BAD_AUTHENTICATION {
            return Err(Error::Auth {
                port: self.port,
                reason: reply.message(),
            });
        }
        Err(self.channel_error(reply.message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_reply_lines() {
        assert_eq!(split_reply_line("250 OK"), Some((250, ' ', "OK")));
        assert_eq!(
            split_reply_line("250-version=0.4.8"),
            Some((250, '-', "version=0.4.8"))
        );
        assert_eq!(split_reply_line("OK"), None);
        assert_eq!(split_reply_line("25x OK"), None);
    }

    #[test]
    fn quotes_passwords() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn reply_message_joins_lines() {
        let reply = Reply {
            status: 515,
            lines: vec!["Authentication failed".to_string()],
        };
        assert!(!reply.is_ok());
        assert_eq!(reply.message(), "515 Authentication failed");
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_channel_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = TcpControlConnector::new(Duration::from_secs(2));
        let err = match connector.connect(9050, port).await {
            Err(e) => e,
            Ok(_) => panic!("expected connection failure"),
        };
        assert!(matches!(err, Error::Channel { port: 9050, .. }));
    }
}
