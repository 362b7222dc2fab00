// Dynamic DNS updates over HTTP

use super::DynDns;
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::Ipv6Addr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Body of one upsert request
#[derive(Debug, Serialize)]
struct SubnameUpdate<'a> {
    host: &'a str,
    ip: Ipv6Addr,
}

/// Posts `{"host": <label>, "ip": <address>}` to a plain-HTTP endpoint,
/// e.g. the dyndns handler of the local router
#[derive(Debug, Clone)]
pub struct HttpDynDns {
    host: String,
    port: u16,
    authority: String,
    path: String,
    timeout: Duration,
}

impl HttpDynDns {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let uri: Uri = endpoint
            .parse()
            .with_context(|| format!("Invalid dynamic DNS endpoint: {}", endpoint))?;
        if uri.scheme_str() != Some("http") {
            bail!("Dynamic DNS endpoint must be an http:// URL: {}", endpoint);
        }
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("Dynamic DNS endpoint has no host: {}", endpoint))?;

        Ok(Self {
            host: authority
                .host()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            port: authority.port_u16().unwrap_or(80),
            authority: authority.as_str().to_string(),
            path: uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            timeout,
        })
    }

    async fn post(&self, body: Vec<u8>) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to connect to {}", self.authority))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake failed")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                log::debug!("Dynamic DNS connection ended: {}", e);
            }
        });

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.path.as_str())
            .header(HOST, self.authority.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let resp = sender.send_request(req).await.context("Request failed")?;
        if !resp.status().is_success() {
            bail!("{} answered {}", self.authority, resp.status());
        }
        Ok(())
    }
}

impl DynDns for HttpDynDns {
    async fn set_subname(&self, label: &str, addr: Ipv6Addr) -> Result<()> {
        let body = serde_json::to_vec(&SubnameUpdate { host: label, ip: addr })?;
        log::debug!("Registering {} -> {} at {}", label, addr, self.authority);

        tokio::time::timeout(self.timeout, self.post(body))
            .await
            .map_err(|_| anyhow!("Timed out after {:?}", self.timeout))?
            .with_context(|| format!("Failed to register {} -> {}", label, addr))
    }
}
