//! HTTP exposition of the collector.
//!
//! `/metrics` (or the configured path) serves the Prometheus text format.
//! `/health` and `/healthz` answer liveness probes with the node's role.

use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const OPENMETRICS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

pub struct MetricsServer {
    address: SocketAddr,
    path: String,
    collector: MetricsCollector,
}

/// What a request path resolves to.
#[derive(Debug, PartialEq, Eq)]
enum Endpoint {
    Metrics,
    Health,
    Index,
    Unknown,
}

impl Endpoint {
    fn resolve(path: &str, metrics_path: &str) -> Self {
        match path {
            p if p == metrics_path => Self::Metrics,
            "/health" | "/healthz" => Self::Health,
            "/" => Self::Index,
            _ => Self::Unknown,
        }
    }
}

struct Shared {
    collector: MetricsCollector,
    path: String,
}

impl MetricsServer {
    pub fn new(address: SocketAddr, path: String, collector: MetricsCollector) -> Self {
        Self {
            address,
            path,
            collector,
        }
    }

    /// Accept connections until shutdown. A bind failure is logged and
    /// ends the server without affecting the control plane.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let listener = match TcpListener::bind(self.address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, address = %self.address, "failed to bind metrics server");
                return;
            }
        };
        info!(address = %self.address, path = %self.path, "metrics server listening");

        let shared = Arc::new(Shared {
            collector: self.collector,
            path: self.path,
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve(stream, peer, Arc::clone(&shared)));
                    }
                    Err(e) => warn!(error = %e, "metrics accept failed"),
                },

                _ = shutdown.recv() => break,
            }
        }

        info!("metrics server stopped");
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let service = service_fn(move |req| {
        let shared = Arc::clone(&shared);
        async move { Ok::<_, Infallible>(respond(&req, &shared)) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(%peer, error = %e, "metrics connection closed with error");
    }
}

fn respond(req: &Request<Incoming>, shared: &Shared) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }

    match Endpoint::resolve(req.uri().path(), &shared.path) {
        Endpoint::Metrics => {
            let mut body = String::new();
            if let Err(e) = encode(&mut body, shared.collector.registry()) {
                error!(error = %e, "failed to encode metrics");
                return text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed\n");
            }
            let mut response = text(StatusCode::OK, body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(OPENMETRICS_TEXT));
            response
        }
        Endpoint::Health => {
            let role = if shared.collector.is_leader() {
                "leader"
            } else {
                "follower"
            };
            text(StatusCode::OK, format!("ok {}\n", role))
        }
        Endpoint::Index => text(
            StatusCode::OK,
            format!("l4plane\n  {}\n  /health\n", shared.path),
        ),
        Endpoint::Unknown => text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_endpoint_resolution() {
        assert_eq!(Endpoint::resolve("/stats", "/stats"), Endpoint::Metrics);
        assert_eq!(Endpoint::resolve("/metrics", "/stats"), Endpoint::Unknown);
        assert_eq!(Endpoint::resolve("/healthz", "/stats"), Endpoint::Health);
        assert_eq!(Endpoint::resolve("/", "/stats"), Endpoint::Index);
    }

    async fn get(address: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(address).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_metrics_and_health() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let collector = MetricsCollector::new();
        collector.set_leader(true);
        let server = MetricsServer::new(address, "/metrics".to_string(), collector);
        let shutdown = crate::util::ShutdownSignal::new();
        let handle = tokio::spawn(server.run(shutdown.subscribe()));

        let mut metrics = String::new();
        for _ in 0..50 {
            if TcpStream::connect(address).await.is_ok() {
                metrics = get(address, "/metrics").await;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(metrics.contains("l4plane_leader 1"));

        let health = get(address, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok leader\n"));
        assert!(get(address, "/nope").await.starts_with("HTTP/1.1 404"));

        shutdown.shutdown();
        handle.await.unwrap();
    }
}
