use super::{Identity, IdentityLookup, IdentityService};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Looks up identities over HTTP, routed through the client's SOCKS port.
///
/// Services are tried in order; the first one returning a usable reply wins.
/// One `reqwest::Client` is kept per SOCKS port so repeated lookups reuse the
/// proxied connection pool.
pub struct HttpIdentityLookup {
    services: Vec<IdentityService>,
    timeout: Duration,
    proxy_host: String,
    clients: Mutex<HashMap<u16, Client>>,
}

impl HttpIdentityLookup {
    pub fn new(services: Vec<IdentityService>, timeout: Duration) -> Self {
        Self {
            services,
            timeout,
            proxy_host: "127.0.0.1".to_string(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, port: u16) -> Result<Client> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&port) {
            return Ok(client.clone());
        }
        // socks5h: hostnames are resolved by tor, not locally
        let proxy_url = format!("socks5h://{}:{}", self.proxy_host, port);
        let proxy = Proxy::all(&proxy_url).map_err(|e| Error::Lookup {
            port,
            reason: format!("invalid proxy {}: {}", proxy_url, e),
        })?;
        let client = Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Lookup {
                port,
                reason: format!("failed to create HTTP client: {}", e),
            })?;
        clients.insert(port, client.clone());
        Ok(client)
    }

    async fn query(
        &self,
        client: &Client,
        service: IdentityService,
    ) -> std::result::Result<Identity, String> {
        let response = client
            .get(service.url())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        service
            .parse_reply(&body)
            .ok_or_else(|| "reply carried no address".to_string())
    }
}

#[async_trait]
impl IdentityLookup for HttpIdentityLookup {
    #[tracing::instrument(skip(self), fields(client.port = port))]
    async fn lookup(&self, port: u16) -> Result<Identity> {
        let client = self.client_for(port)?;
        let mut failures = Vec::new();

        for service in &self.services {
            match self.query(&client, *service).await {
                Ok(identity) => {
                    debug!("{} reported {}", service, identity);
                    return Ok(identity);
                }
                Err(reason) => {
                    debug!("{} lookup failed: {}", service, reason);
                    failures.push(format!("{}: {}", service, reason));
                }
            }
        }

        Err(Error::Lookup {
            port,
            reason: if failures.is_empty() {
                "no identity services configured".to_string()
            } else {
                failures.join("; ")
            },
        })
    }

    fn attempts(&self) -> u32 {
        u32::try_from(self.services.len()).unwrap_or(u32::MAX).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn lookup_through_dead_proxy_fails_with_every_service_named() {
        let port = unused_port();
        let lookup = HttpIdentityLookup::new(
            vec![IdentityService::Ipinfo, IdentityService::IpApi],
            Duration::from_secs(2),
        );

        let err = lookup.lookup(port).await.unwrap_err();
        match err {
            Error::Lookup { port: p, reason } => {
                assert_eq!(p, port);
                assert!(reason.contains("ipinfo"));
                assert!(reason.contains("ip-api"));
            }
            other => panic!("expected lookup error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn hanging_service_falls_through_to_the_next() {
        // Accepts SOCKS connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let lookup = HttpIdentityLookup::new(
            vec![IdentityService::Ipinfo, IdentityService::IpApi],
            Duration::from_millis(200),
        );
        assert_eq!(lookup.attempts(), 2);

        let err = lookup.lookup(port).await.unwrap_err();
        let reason = match err {
            Error::Lookup { reason, .. } => reason,
            other => panic!("expected lookup error, got {:?}", other),
        };
        assert!(reason.contains("ipinfo"), "{}", reason);
        assert!(reason.contains("ip-api"), "{}", reason);
    }

    #[test]
    fn clients_are_reused_per_port() {
        let lookup = HttpIdentityLookup::new(vec![IdentityService::Ipinfo], Duration::from_secs(1));
        lookup.client_for(9050).unwrap();
        lookup.client_for(9050).unwrap();
        lookup.client_for(9060).unwrap();
        assert_eq!(lookup.clients.lock().len(), 2);
    }
}
