// Reverse proxy from a service's public address to its local port.
//
// Every accepted connection is served as HTTP/1.1. Each request is sent to
// the upstream over its own connection whose local end is bound to the
// service's public address, so the upstream sees traffic coming from the
// address it is published under.
//
// Forwarding follows the usual reverse-proxy rules: hop-by-hop headers are
// dropped in both directions, `X-Forwarded-For` gets the client appended,
// the request target is reduced to origin form and `Host` is passed through
// untouched. Protocol upgrades (WebSocket) are tunnelled once the upstream
// agrees with `101 Switching Protocols`.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST, HeaderMap, HeaderValue, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe one connection rather than the message
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Where a listener's traffic goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upstream {
    /// The service itself, normally `[::1]:<port>`
    pub target: SocketAddr,
    /// Local address for the outbound leg
    pub source: IpAddr,
}

/// Serve `listener` until it fails or `shutdown` turns true.
///
/// An accept failure ends the task with an error. Shutdown (or the shutdown
/// sender going away) ends it with `Ok`.
pub async fn serve(
    listener: TcpListener,
    upstream: Upstream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local = listener.local_addr()?;
    let upstream = Arc::new(upstream);
    log::debug!("Proxying http://{} -> {}", local, upstream.target);

    if *shutdown.borrow_and_update() {
        return Ok(());
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) =
                    accepted.with_context(|| format!("Failed to accept on {}", local))?;
                spawn_connection(stream, peer, upstream.clone());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    log::debug!("Proxy on {} shutting down", local);
                    return Ok(());
                }
            }
        }
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, upstream: Arc<Upstream>) {
    tokio::spawn(async move {
        let service = service_fn(move |req: Request<Incoming>| {
            let upstream = upstream.clone();
            async move { Ok::<_, Infallible>(forward(req, &upstream, peer).await) }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            log::debug!("Connection from {} ended: {}", peer, e);
        }
    });
}

async fn forward(req: Request<Incoming>, upstream: &Upstream, peer: SocketAddr) -> Response<ProxyBody> {
    match try_forward(req, upstream, peer).await {
        Ok(resp) => resp,
        Err(e) => {
            log::warn!("{} -> {}: {:#}", peer, upstream.target, e);
            bad_gateway()
        }
    }
}

async fn try_forward(
    mut req: Request<Incoming>,
    upstream: &Upstream,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>> {
    let client_upgrade = upgrade_protocol(req.headers())
        .is_some()
        .then(|| hyper::upgrade::on(&mut req));
    prepare_request(&mut req, upstream.target, peer.ip())?;

    let stream = connect_from(upstream.source, upstream.target)
        .await
        .with_context(|| format!("Failed to connect to {}", upstream.target))?;
    let (mut sender, conn) = client_http1::handshake::<_, Incoming>(TokioIo::new(stream))
        .await
        .context("Upstream handshake failed")?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            log::debug!("Upstream connection ended: {}", e);
        }
    });

    let mut resp = sender
        .send_request(req)
        .await
        .context("Upstream request failed")?;

    if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut resp);
            tokio::spawn(tunnel(client_upgrade, upstream_upgrade, peer));
            return Ok(resp.map(|body| body.boxed()));
        }
    }

    strip_hop_by_hop(resp.headers_mut());
    Ok(resp.map(|body| body.boxed()))
}

async fn tunnel(client: hyper::upgrade::OnUpgrade, upstream: hyper::upgrade::OnUpgrade, peer: SocketAddr) {
    match tokio::try_join!(client, upstream) {
        Ok((client, upstream)) => {
            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                log::debug!("Upgraded connection from {} ended: {}", peer, e);
            }
        }
        Err(e) => log::debug!("Upgrade for {} failed: {}", peer, e),
    }
}

/// TCP connection to `target` whose local end is bound to `source`
async fn connect_from(source: IpAddr, target: SocketAddr) -> io::Result<TcpStream> {
    let socket = match target {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(source, 0))?;
    socket.connect(target).await
}

/// Header names listed in `Connection`
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// The protocol a request asks to switch to, if any
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    if connection_tokens(headers).iter().any(|t| t == "upgrade") {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for token in connection_tokens(headers) {
        headers.remove(token.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Rewrite a client request into the one sent upstream
fn prepare_request<B>(req: &mut Request<B>, target: SocketAddr, client: IpAddr) -> Result<()> {
    let upgrade = upgrade_protocol(req.headers());

    // Absolute-form requests carry the host in the target instead
    if !req.headers().contains_key(HOST) {
        let host = match req.uri().authority() {
            Some(authority) => HeaderValue::from_str(authority.as_str())?,
            None => HeaderValue::from_str(&target.to_string())?,
        };
        req.headers_mut().insert(HOST, host);
    }
    let origin_form = Uri::try_from(
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/"),
    )?;
    *req.uri_mut() = origin_form;

    strip_hop_by_hop(req.headers_mut());
    if let Some(protocol) = upgrade {
        req.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        req.headers_mut().insert(UPGRADE, protocol);
    }

    let mut forwarded_for: Vec<String> = req
        .headers()
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();
    forwarded_for.push(client.to_string());
    req.headers_mut().insert(
        "x-forwarded-for",
        HeaderValue::from_str(&forwarded_for.join(", "))?,
    );
    Ok(())
}

fn bad_gateway() -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(b"Bad Gateway\n"))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}
