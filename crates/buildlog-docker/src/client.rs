use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use buildlog_types::{ContainerDescriptor, StreamKind};

use crate::wire::{ContainerSummary, ErrorResponse, EventMessage, InspectResponse};
use crate::{ByteStream, ContainerInspection, ContainerRuntime, EventStream, RuntimeError};

/// Socket mounted into build environments
pub const CODEFRESH_DOCKER_SOCKET: &str = "/var/run/codefresh/docker.sock";

/// Standard docker daemon socket
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Docker Engine API client over a unix socket
///
/// Every request opens its own connection; long-lived streams keep theirs
/// until the remote side closes it.
#[derive(Clone, Debug)]
pub struct DockerClient {
    socket_path: PathBuf,
}

impl DockerClient {
    /// Create a client for the given socket path
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Create a client for the configured socket, falling back to the
    /// build environment socket and then the standard one
    pub fn from_socket_or_default(configured: Option<PathBuf>) -> Self {
        let path = configured.unwrap_or_else(|| {
            if Path::new(CODEFRESH_DOCKER_SOCKET).exists() {
                PathBuf::from(CODEFRESH_DOCKER_SOCKET)
            } else {
                PathBuf::from(DEFAULT_DOCKER_SOCKET)
            }
        });
        Self::new(path)
    }

    /// Socket this client connects to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn request(method: Method, path: &str) -> Result<Request<Empty<Bytes>>, RuntimeError> {
        Ok(Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "docker")
            .body(Empty::new())?)
    }

    /// Send a request on a fresh connection
    async fn send(&self, request: Request<Empty<Bytes>>) -> Result<Response<Incoming>, RuntimeError> {
        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|source| RuntimeError::Connect {
                    path: self.socket_path.clone(),
                    source,
                })?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!(error = %e, "Docker connection closed with error");
            }
        });

        Ok(sender.send_request(request).await?)
    }

    /// Send a request and fail on non-success statuses
    async fn send_checked(
        &self,
        method: Method,
        path: &str,
    ) -> Result<Response<Incoming>, RuntimeError> {
        let response = self.send(Self::request(method, path)?).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::SWITCHING_PROTOCOLS {
            return Ok(response);
        }

        let body = response.into_body().collect().await?.to_bytes();
        let message = serde_json::from_slice::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());

        Err(RuntimeError::Status {
            status: status.as_u16(),
            path: path.to_string(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RuntimeError> {
        let response = self.send_checked(Method::GET, path).await?;
        let body = response.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }

    fn body_stream(response: Response<Incoming>) -> ByteStream {
        response
            .into_body()
            .into_data_stream()
            .map_err(RuntimeError::from)
            .boxed()
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let filters = serde_json::json!({
            "type": ["container"],
            "event": ["create", "start"],
        });
        let query = serde_urlencoded::to_string([("filters", filters.to_string())])?;
        let response = self
            .send_checked(Method::GET, &format!("/events?{}", query))
            .await?;

        let body = response
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other);
        let lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());

        let events = lines.filter_map(|line| async move {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(RuntimeError::from(e))),
            };
            if line.trim().is_empty() {
                return None;
            }
            match serde_json::from_str::<EventMessage>(&line) {
                Ok(message) if message.is_container_event() => Some(Ok(message.into_descriptor())),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable docker event");
                    None
                }
            }
        });

        Ok(events.boxed())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        let summaries: Vec<ContainerSummary> = self.get_json("/containers/json").await?;
        Ok(summaries
            .into_iter()
            .map(ContainerSummary::into_descriptor)
            .collect())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspection, RuntimeError> {
        let response: InspectResponse = self
            .get_json(&format!("/containers/{}/json", container_id))
            .await?;
        Ok(response.into())
    }

    async fn attach(
        &self,
        container_id: &str,
        stream: StreamKind,
    ) -> Result<ByteStream, RuntimeError> {
        let (stdout, stderr) = match stream {
            StreamKind::Stdout => ("1", "0"),
            StreamKind::Stderr => ("0", "1"),
        };
        let query = serde_urlencoded::to_string([
            ("stream", "1"),
            ("stdout", stdout),
            ("stderr", stderr),
        ])?;
        let path = format!("/containers/{}/attach?{}", container_id, query);

        let mut request = Self::request(Method::POST, &path)?;
        request
            .headers_mut()
            .insert(CONNECTION, http::HeaderValue::from_static("Upgrade"));
        request
            .headers_mut()
            .insert(UPGRADE, http::HeaderValue::from_static("tcp"));

        let response = self.send(request).await?;
        match response.status() {
            StatusCode::SWITCHING_PROTOCOLS => {
                let upgraded = hyper::upgrade::on(response).await?;
                Ok(ReaderStream::new(TokioIo::new(upgraded))
                    .map_err(RuntimeError::from)
                    .boxed())
            }
            // Older daemons hijack the connection without an upgrade
            status if status.is_success() => Ok(Self::body_stream(response)),
            status => Err(RuntimeError::Status {
                status: status.as_u16(),
                path,
                message: "attach was refused".to_string(),
            }),
        }
    }

    async fn logs(&self, container_id: &str) -> Result<ByteStream, RuntimeError> {
        let query = serde_urlencoded::to_string([
            ("follow", "1"),
            ("stdout", "1"),
            ("stderr", "1"),
        ])?;
        let response = self
            .send_checked(
                Method::GET,
                &format!("/containers/{}/logs?{}", container_id, query),
            )
            .await?;
        Ok(Self::body_stream(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildlog_types::ContainerStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Serve a single canned HTTP response on a unix socket
    fn serve_once(listener: UnixListener, response: Vec<u8>) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        })
    }

    fn http_response(status: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            status,
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    #[tokio::test]
    async fn test_inspect_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve_once(
            listener,
            http_response("200 OK", br#"{"Id":"abc","Config":{"Tty":true}}"#),
        );

        let client = DockerClient::new(&path);
        let inspection = client.inspect("abc").await.unwrap();
        assert!(inspection.tty);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /containers/abc/json HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_error_status_carries_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = serve_once(
            listener,
            http_response("404 Not Found", br#"{"message":"No such container: nope"}"#),
        );

        let client = DockerClient::new(&path);
        let err = client.inspect("nope").await.unwrap_err();
        match err {
            RuntimeError::Status {
                status, message, ..
            } => {
                assert_eq!(status, 404);
                assert_eq!(message, "No such container: nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_logs_stream_yields_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let frame = [1u8, 0, 0, 0, 0, 0, 0, 3, b'h', b'i', b'\n'];
        let server = serve_once(listener, http_response("200 OK", &frame));

        let client = DockerClient::new(&path);
        let stream = client.logs("abc").await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(body, frame);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /containers/abc/logs?follow=1&stdout=1&stderr=1 "));
    }

    #[tokio::test]
    async fn test_events_yield_container_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let body = concat!(
            r#"{"Type":"network","Action":"connect","Actor":{"ID":"net"}}"#,
            "\n\n",
            "not json\n",
            r#"{"Type":"container","Action":"create","Actor":{"ID":"abc","Attributes":{"io.codefresh.logger.id":"l1"}}}"#,
            "\n",
            r#"{"Type":"container","Action":"start","Actor":{"ID":"abc","Attributes":{}}}"#,
            "\n",
        );
        let server = serve_once(listener, http_response("200 OK", body.as_bytes()));

        let client = DockerClient::new(&path);
        let events: Vec<ContainerDescriptor> =
            client.events().await.unwrap().try_collect().await.unwrap();

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.id.as_deref() == Some("abc")));
        assert_eq!(events[0].status, Some(ContainerStatus::Created));
        assert_eq!(events[0].labels.logger_id(), Some("l1"));
        assert_eq!(events[1].status, Some(ContainerStatus::Started));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /events?filters="));
    }

    #[tokio::test]
    async fn test_attach_upgrades_to_raw_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let frame = [2u8, 0, 0, 0, 0, 0, 0, 4, b'o', b'o', b'p', b'\n'];
        let mut response = b"HTTP/1.1 101 UPGRADED\r\n\
            Content-Type: application/vnd.docker.raw-stream\r\n\
            Connection: Upgrade\r\n\
            Upgrade: tcp\r\n\r\n"
            .to_vec();
        response.extend_from_slice(&frame);
        let server = serve_once(listener, response);

        let client = DockerClient::new(&path);
        let stream = client.attach("abc", StreamKind::Stderr).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(body, frame);

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /containers/abc/attach?stream=1&stdout=0&stderr=1 "));
        assert!(request.contains("upgrade: tcp"));
    }

    #[tokio::test]
    async fn test_attach_without_upgrade_reads_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let frame = [1u8, 0, 0, 0, 0, 0, 0, 3, b'o', b'k', b'\n'];
        let _server = serve_once(listener, http_response("200 OK", &frame));

        let client = DockerClient::new(&path);
        let stream = client.attach("abc", StreamKind::Stdout).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(body, frame);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = DockerClient::new(dir.path().join("missing.sock"));
        let err = client.list_containers().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Connect { .. }));
    }

    #[test]
    fn test_configured_socket_wins() {
        let client = DockerClient::from_socket_or_default(Some(PathBuf::from("/tmp/custom.sock")));
        assert_eq!(client.socket_path(), Path::new("/tmp/custom.sock"));
    }
}
