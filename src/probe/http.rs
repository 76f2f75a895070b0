// ABOUTME: HTTP/1.1 GET liveness probe over a fresh TCP connection per attempt.
// ABOUTME: Uses hyper's low-level client connection, spawning the connection driver on tokio.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use super::{Endpoint, HealthProbe, ProbeError, ProbeResponse};

#[derive(Debug, Clone, Default)]
pub struct HttpProbe;

impl HttpProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<ProbeResponse, ProbeError> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| ProbeError::Connect(format!("{}: {e}", endpoint.base_url())))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProbeError::Connect(format!("HTTP handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("probe connection error: {e}");
            }
        });

        let req = hyper::Request::builder()
            .method("GET")
            .uri(endpoint.path())
            .header("Host", endpoint.authority())
            .header("User-Agent", concat!("halyard/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::Request(format!("failed to build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProbeError::Request(e.to_string()))?;
        let status = resp.status().as_u16();

        // Drain so the server sees a complete exchange; the body itself is irrelevant.
        if let Err(e) = resp.into_body().collect().await {
            tracing::debug!(endpoint = %endpoint, status, "health response body unreadable: {e}");
        }

        Ok(ProbeResponse { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> (Endpoint, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{port}/health")).unwrap();
        (endpoint, handle)
    }

    #[tokio::test]
    async fn reports_status_code() {
        let (endpoint, server) =
            serve_once("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n").await;

        let response = HttpProbe::new().probe(&endpoint).await.unwrap();
        assert_eq!(response.status, 503);
        assert!(!response.is_healthy());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /health HTTP/1.1"));
    }

    #[tokio::test]
    async fn healthy_response() {
        let (endpoint, _server) =
            serve_once("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        assert!(HttpProbe::new().probe(&endpoint).await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn truncated_body_still_reports_status() {
        let (endpoint, _server) =
            serve_once("HTTP/1.1 200 OK\r\ncontent-length: 64\r\n\r\nok").await;
        let response = HttpProbe::new().probe(&endpoint).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let err = HttpProbe::new().probe(&endpoint).await.unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)));
    }
}
