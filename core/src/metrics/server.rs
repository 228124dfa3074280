/// Metrics HTTP server - serves the registry in Prometheus text format
use crate::error::{NodeError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const METRICS_PATH: &str = "/metrics";

/// Render every series in `registry` in the text exposition format
pub fn render_metrics(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| NodeError::Metrics(format!("Non UTF-8 exposition: {}", e)))
}

/// A bound metrics listener, ready to serve
pub struct MetricsServer {
    listener: TcpListener,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; runs until the task is dropped
    pub async fn serve(self, registry: Arc<Registry>) -> Result<()> {
        info!("Metrics server started on http://{}{}", self.local_addr()?, METRICS_PATH);

        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Failed to accept metrics connection: {}", e);
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let registry = registry.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| handle_request(req, registry.clone()));

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<Registry>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, METRICS_PATH) => match render_metrics(&registry) {
            Ok(body) => Response::builder()
                .header(CONTENT_TYPE, TextEncoder::new().format_type())
                .body(Full::new(Bytes::from(body))),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Full::new(Bytes::from(format!("Failed to encode metrics: {}", e))))
            }
        },
        (_, METRICS_PATH) => Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header(ALLOW, "GET")
            .body(Full::new(Bytes::from("Method not allowed"))),
        (&Method::GET, "/") => Response::builder()
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from(format!(
                "wnode-status: metrics at {}\n",
                METRICS_PATH
            )))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from("Not found"))),
    };

    // Builder only fails on invalid header values, and all of ours are static
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn spawn_server() -> SocketAddr {
        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve(Arc::new(Registry::new())));
        addr
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let addr = spawn_server().await;
        let response = raw_request(addr, "GET /nope HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_post_metrics_is_405() {
        let addr = spawn_server().await;
        let response = raw_request(
            addr,
            "POST /metrics HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn test_get_metrics_is_text() {
        let addr = spawn_server().await;
        let response = raw_request(addr, "GET /metrics HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.to_lowercase().contains("content-type: text/plain"));
    }
}
