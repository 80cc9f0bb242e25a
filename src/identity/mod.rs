//! Resolving a client's externally visible network identity.
//!
//! - `IdentityLookup` - trait the registry talks to
//! - `HttpIdentityLookup` - asks public "what is my IP" services through the
//!   client's SOCKS port

mod http;

pub use http::HttpIdentityLookup;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally observed address and locality of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub address: String,
    /// Country code.
    pub region: String,
    /// State or province.
    pub subregion: String,
    /// City.
    pub locality: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, {})",
            self.address, self.region, self.subregion, self.locality
        )
    }
}

#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Resolve the identity seen by traffic leaving through SOCKS `port`.
    async fn lookup(&self, port: u16) -> Result<Identity>;

    /// Number of requests one `lookup` may make in sequence. The registry
    /// bounds a whole lookup by this many per-request deadlines.
    fn attempts(&self) -> u32 {
        1
    }
}

/// A public service reporting the caller's address as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityService {
    /// `https://ipinfo.io/json`
    Ipinfo,
    /// `http://ip-api.com/json`
    IpApi,
}

impl IdentityService {
    pub fn url(&self) -> &'static str {
        match self {
            IdentityService::Ipinfo => "https://ipinfo.io/json",
            IdentityService::IpApi => "http://ip-api.com/json",
        }
    }

    /// Extract an identity from the service's JSON reply.
    pub fn parse_reply(&self, body: &serde_json::Value) -> Option<Identity> {
        let field = |name: &str| body.get(name).and_then(|v| v.as_str()).map(str::to_string);
        match self {
            IdentityService::Ipinfo => Some(Identity {
                address: field("ip")?,
                region: field("country").unwrap_or_default(),
                subregion: field("region").unwrap_or_default(),
                locality: field("city").unwrap_or_default(),
            }),
            IdentityService::IpApi => {
                if field("status").as_deref() == Some("fail") {
                    return None;
                }
                Some(Identity {
                    address: field("query")?,
                    region: field("countryCode").unwrap_or_default(),
                    subregion: field("regionName").unwrap_or_default(),
                    locality: field("city").unwrap_or_default(),
                })
            }
        }
    }
}

impl fmt::Display for IdentityService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityService::Ipinfo => f.write_str("ipinfo"),
            IdentityService::IpApi => f.write_str("ip-api"),
        }
    }
}
