use super::labels::{is_known_label, normalize_label};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the distinguished, externally managed descriptor.
pub const DEFAULT_DESCRIPTOR_NAME: &str = "torrc";

/// SocksPort tor uses when the default descriptor does not set one.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Algorithm tag that prefixes every `HashedControlPassword`.
const HASH_TAG: &str = "16";

/// Number of hex characters following `16:` in a hashed password.
const HASH_BODY_LEN: usize = 58;

/// Which kind of descriptor a file is, derived from its name.
///
/// `torrc` is the system daemon's file; `torrc.<n>` are the custom clients
/// this tool creates and manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DescriptorKind {
    Default,
    Custom(u32),
}

impl DescriptorKind {
    /// Classify a file name. Returns `None` for files that are not descriptors
    /// (`torrc.sample`, editor backups, ...).
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name == DEFAULT_DESCRIPTOR_NAME {
            return Some(DescriptorKind::Default);
        }
        let suffix = name.strip_prefix("torrc.")?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok().map(DescriptorKind::Custom)
    }

    pub fn file_name(&self) -> String {
        match self {
            DescriptorKind::Default => DEFAULT_DESCRIPTOR_NAME.to_string(),
            DescriptorKind::Custom(n) => format!("{}.{}", DEFAULT_DESCRIPTOR_NAME, n),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, DescriptorKind::Default)
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Parsed representation of one torrc descriptor file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub path: PathBuf,
    pub kind: DescriptorKind,
    pub socks_port: u16,
    pub control_port: u16,
    pub exit_labels: BTreeSet<String>,
    pub data_directory: Option<PathBuf>,
    /// Hashed control password, never the plaintext.
    pub secret_hash: Option<String>,
}

impl ConfigDescriptor {
    /// Read and parse a descriptor file. The descriptor kind comes from the
    /// file name, so the file must be named `torrc` or `torrc.<n>`.
    pub fn load(path: &Path) -> Result<Self> {
        let kind = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(DescriptorKind::from_file_name)
            .ok_or_else(|| Error::Parse {
                path: path.to_path_buf(),
                reason: "file name is neither 'torrc' nor 'torrc.<number>'".to_string(),
            })?;
        let content = fs::read_to_string(path).map_err(|e| Error::Parse {
            path: path.to_path_buf(),
            reason: format!("failed to read file: {}", e),
        })?;
        Self::parse(path, kind, &content)
    }

    /// Parse descriptor directives from `content`.
    ///
    /// Recognized keys match case-insensitively; anything else is ignored.
    /// For repeated port directives the first one wins, as tor listens on all
    /// of them but the first is the one clients are addressed by.
    pub fn parse(path: &Path, kind: DescriptorKind, content: &str) -> Result<Self> {
        let fail = |reason: String| Error::Parse {
            path: path.to_path_buf(),
            reason,
        };

        let mut socks_port = None;
        let mut control_port = None;
        let mut exit_labels = BTreeSet::new();
        let mut data_directory = None;
        let mut secret_hash = None;

        for (idx, raw_line) in content.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            let line_no = idx + 1;

            match key.to_ascii_lowercase().as_str() {
                "socksport" => {
                    let port = parse_port(value)
                        .map_err(|e| fail(format!("line {}: SocksPort {}", line_no, e)))?;
                    socks_port.get_or_insert(port);
                }
                "controlport" => {
                    let port = parse_port(value)
                        .map_err(|e| fail(format!("line {}: ControlPort {}", line_no, e)))?;
                    control_port.get_or_insert(port);
                }
                "exitnodes" => {
                    exit_labels = parse_exit_labels(value)
                        .map_err(|e| fail(format!("line {}: ExitNodes {}", line_no, e)))?;
                }
                "datadirectory" => {
                    data_directory = Some(
                        parse_data_directory(value)
                            .map_err(|e| fail(format!("line {}: DataDirectory {}", line_no, e)))?,
                    );
                }
                "hashedcontrolpassword" => {
                    secret_hash = Some(parse_secret_hash(value).map_err(|e| {
                        fail(format!("line {}: HashedControlPassword {}", line_no, e))
                    })?);
                }
                _ => {}
            }
        }

        let socks_port = match (socks_port, kind) {
            (Some(port), _) => port,
            (None, DescriptorKind::Default) => DEFAULT_SOCKS_PORT,
            (None, DescriptorKind::Custom(_)) => {
                return Err(fail("missing SocksPort directive".to_string()))
            }
        };
        let control_port = match control_port {
            Some(port) => port,
            None => socks_port.checked_add(1).ok_or_else(|| {
                fail(format!(
                    "no ControlPort given and SocksPort {} leaves no room for one",
                    socks_port
                ))
            })?,
        };
        if control_port == socks_port {
            return Err(fail(format!(
                "SocksPort and ControlPort are both {}",
                socks_port
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            socks_port,
            control_port,
            exit_labels,
            data_directory,
            secret_hash,
        })
    }

    pub fn is_default(&self) -> bool {
        self.kind.is_default()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.kind.file_name())
    }

    /// Render the descriptor as torrc directives.
    pub fn to_torrc(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("SocksPort {}\n", self.socks_port));
        out.push_str(&format!("ControlPort {}\n", self.control_port));
        if let Some(ref dir) = self.data_directory {
            out.push_str(&format!("DataDirectory {}\n", dir.display()));
        }
        if !self.exit_labels.is_empty() {
            out.push_str(&format!("ExitNodes {}\n", format_exit_labels(&self.exit_labels)));
        }
        if let Some(ref hash) = self.secret_hash {
            out.push_str(&format!("HashedControlPassword {}\n", hash));
        }
        out
    }
}

/// Format labels in torrc `{us},{de}` form.
pub fn format_exit_labels(labels: &BTreeSet<String>) -> String {
    labels
        .iter()
        .map(|l| format!("{{{}}}", l))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a port value: `9050`, `127.0.0.1:9050`, or either followed by flags
/// such as `IsolateDestAddr`.
fn parse_port(value: &str) -> std::result::Result<u16, String> {
    let token = value
        .split_whitespace()
        .next()
        .ok_or_else(|| "has no value".to_string())?;
    let port_part = token.rsplit(':').next().unwrap_or(token);
    match port_part.parse::<u16>() {
        Ok(0) => Err("0 disables the listener; a managed client needs a port".to_string()),
        Ok(port) => Ok(port),
        Err(_) => Err(format!("'{}' is not a port number", token)),
    }
}

fn parse_exit_labels(value: &str) -> std::result::Result<BTreeSet<String>, String> {
    let mut labels = BTreeSet::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if !(entry.starts_with('{') && entry.ends_with('}')) {
            return Err(format!("entry '{}' is not in {{label}} form", entry));
        }
        let label = normalize_label(entry);
        if !is_known_label(&label) {
            return Err(format!("label '{}' is not a known country code", label));
        }
        labels.insert(label);
    }
    Ok(labels)
}

fn parse_data_directory(value: &str) -> std::result::Result<PathBuf, String> {
    if value.is_empty() {
        return Err("has no value".to_string());
    }
    let path = PathBuf::from(value);
    if !path.is_absolute() {
        return Err(format!("'{}' must be an absolute path", value));
    }
    Ok(path)
}

fn parse_secret_hash(value: &str) -> std::result::Result<String, String> {
    let hash = value.split_whitespace().next().unwrap_or("");
    let body = hash
        .strip_prefix(HASH_TAG)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| format!("must start with '{}:'", HASH_TAG))?;
    if body.len() != HASH_BODY_LEN || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!(
            "must be followed by {} hex characters, got {}",
            HASH_BODY_LEN,
            body.len()
        ));
    }
    Ok(hash.to_string())
}

/// List descriptor files in `config_dir`, default first, then by suffix.
pub fn discover_descriptors(config_dir: &Path) -> Result<Vec<(DescriptorKind, PathBuf)>> {
    let entries = fs::read_dir(config_dir).map_err(|e| Error::ConfigDirUnavailable {
        path: config_dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::ConfigDirUnavailable {
            path: config_dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match DescriptorKind::from_file_name(name) {
            Some(kind) => found.push((kind, entry.path())),
            None => tracing::trace!("Ignoring non-descriptor file {:?}", entry.path()),
        }
    }
    found.sort();
    Ok(found)
}
