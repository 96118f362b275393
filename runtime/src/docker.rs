//! Container runtime API client over the Docker Unix socket.
//!
//! Every call opens a fresh HTTP/1.1 connection on the socket. Connecting is
//! bounded by the connect timeout; waiting for a response head, and for each
//! body chunk after it, is bounded by the request timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper::body::{Bytes, HttpBody};
use hyper::client::conn::SendRequest;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request, Response, StatusCode};
use layerscan_core::config::DockerConfig;
use layerscan_core::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

/// Image as listed by `GET /images/json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub created: i64,
}

impl ImageSummary {
    pub fn tags(&self) -> &[String] {
        self.repo_tags.as_deref().unwrap_or(&[])
    }
}

/// Subset of `GET /images/{name}/json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDetails {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
}

/// Result of an image inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectOutcome {
    Found(ImageDetails),
    NotFound,
}

/// One line of the `POST /images/create` progress stream.
#[derive(Debug, Default, Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Error body returned by the daemon on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Split `name[:tag]` into repository and tag.
///
/// A colon before the last `/` belongs to a registry port. Digest
/// references (`repo@sha256:...`) have no tag.
pub fn split_repository(name: &str) -> (&str, Option<&str>) {
    if name.contains('@') {
        return (name, None);
    }
    let base = name.rfind('/').map(|pos| pos + 1).unwrap_or(0);
    match name[base..].rfind(':') {
        Some(pos) => {
            let split = base + pos;
            (&name[..split], Some(&name[split + 1..]))
        }
        None => (name, Some("latest")),
    }
}

/// Percent-encode a query value.
fn encode_query(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}

/// Client for the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl DockerClient {
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Get the socket path this client talks to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn transport(endpoint: &str, message: impl std::fmt::Display) -> ScanError {
        ScanError::Transport {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
        }
    }

    async fn connect(&self) -> Result<SendRequest<Body>> {
        let endpoint = self.socket_path.display().to_string();
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| {
                ScanError::Timeout(format!(
                    "Connecting to {} took longer than {:?}",
                    endpoint, self.connect_timeout
                ))
            })?
            .map_err(|e| Self::transport(&endpoint, e))?;

        let (sender, connection) = hyper::client::conn::handshake(stream)
            .await
            .map_err(|e| Self::transport(&endpoint, e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Docker API connection closed with error");
            }
        });

        Ok(sender)
    }

    /// Send one request and wait for the response head.
    async fn send(&self, method: Method, path: &str) -> Result<Response<Body>> {
        let mut sender = self.connect().await?;

        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, "docker")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::empty())
            .map_err(|e| Self::transport(path, e))?;

        tracing::debug!(method = %method, path, "Docker API request");

        tokio::time::timeout(self.request_timeout, sender.send_request(request))
            .await
            .map_err(|_| {
                ScanError::Timeout(format!(
                    "{} {} got no response within {:?}",
                    method, path, self.request_timeout
                ))
            })?
            .map_err(|e| Self::transport(path, e))
    }

    /// Next body chunk, bounded by the request timeout.
    async fn next_chunk(&self, path: &str, body: &mut Body) -> Result<Option<Bytes>> {
        match tokio::time::timeout(self.request_timeout, body.data()).await {
            Err(_) => Err(ScanError::Timeout(format!(
                "{} stalled for {:?} while streaming",
                path, self.request_timeout
            ))),
            Ok(None) => Ok(None),
            Ok(Some(chunk)) => chunk.map(Some).map_err(|e| Self::transport(path, e)),
        }
    }

    async fn read_body(&self, path: &str, body: &mut Body) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        while let Some(chunk) = self.next_chunk(path, body).await? {
            content.extend_from_slice(&chunk);
        }
        Ok(content)
    }

    /// Turn a non-2xx response into an error.
    async fn check(&self, path: &str, response: Response<Body>) -> Result<Response<Body>> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.into_body();
        let content = self.read_body(path, &mut body).await.unwrap_or_default();
        let message = serde_json::from_slice::<ApiError>(&content)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&content).trim().to_string());

        if status == StatusCode::NOT_FOUND {
            return Err(ScanError::NotFound(message));
        }
        Err(Self::transport(path, format!("{}: {}", status, message)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(Method::GET, path).await?;
        let mut body = self.check(path, response).await?.into_body();
        let content = self.read_body(path, &mut body).await?;
        serde_json::from_slice(&content).map_err(|e| Self::transport(path, e))
    }

    /// Check the daemon is reachable.
    pub async fn ping(&self) -> Result<()> {
        let path = "/_ping";
        let response = self.send(Method::GET, path).await?;
        self.check(path, response).await?;
        Ok(())
    }

    /// List local images.
    pub async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.get_json("/images/json").await
    }

    /// Inspect a local image by name or id.
    pub async fn inspect_image(&self, name: &str) -> Result<InspectOutcome> {
        let path = format!("/images/{}/json", name);
        match self.get_json::<ImageDetails>(&path).await {
            Ok(details) => Ok(InspectOutcome::Found(details)),
            Err(e) if e.is_not_found() => Ok(InspectOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Pull an image, consuming the progress stream.
    ///
    /// An `error` reported on the progress stream is returned verbatim.
    pub async fn pull_image(&self, name: &str) -> Result<()> {
        let (image, tag) = split_repository(name);
        let mut path = format!("/images/create?fromImage={}", encode_query(image));
        if let Some(tag) = tag {
            path.push_str(&format!("&tag={}", encode_query(tag)));
        }

        tracing::info!(image, tag = tag.unwrap_or(""), "Pulling image");

        let response = self.send(Method::POST, &path).await?;
        let mut body = self.check(&path, response).await?.into_body();

        let mut pending: Vec<u8> = Vec::new();
        loop {
            let chunk = self.next_chunk(&path, &mut body).await?;
            let finished = chunk.is_none();
            if let Some(chunk) = chunk {
                pending.extend_from_slice(&chunk);
            }

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                Self::handle_progress(&path, &line)?;
            }

            if finished {
                if !pending.is_empty() {
                    Self::handle_progress(&path, &pending)?;
                }
                break;
            }
        }

        tracing::info!(image = name, "Pull complete");
        Ok(())
    }

    fn handle_progress(path: &str, line: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let progress: PullProgress = match serde_json::from_str(text) {
            Ok(progress) => progress,
            Err(e) => {
                tracing::debug!(line = %text, error = %e, "Ignoring unreadable pull progress");
                return Ok(());
            }
        };

        if let Some(error) = progress.error {
            return Err(Self::transport(path, error));
        }
        if let Some(status) = progress.status {
            tracing::debug!(id = progress.id.as_deref().unwrap_or(""), status = %status, "Pull progress");
        }
        Ok(())
    }

    /// Export an image (`docker save`) into `dest`, returning the bytes written.
    pub async fn export_image(&self, name: &str, dest: &Path) -> Result<u64> {
        let path = format!("/images/{}/get", name);
        let response = self.send(Method::GET, &path).await?;
        let mut body = self.check(&path, response).await?.into_body();

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk(&path, &mut body).await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        tracing::info!(image = name, dest = %dest.display(), bytes = written, "Image exported");
        Ok(written)
    }

    /// Make sure an image is available locally, pulling it once if needed.
    pub async fn ensure_image(&self, name: &str) -> Result<ImageDetails> {
        if let InspectOutcome::Found(details) = self.inspect_image(name).await? {
            return Ok(details);
        }

        tracing::info!(image = name, "Image not found locally");
        self.pull_image(name).await?;

        match self.inspect_image(name).await? {
            InspectOutcome::Found(details) => Ok(details),
            InspectOutcome::NotFound => Err(ScanError::NotFound(format!(
                "Image {} is still missing after pull",
                name
            ))),
        }
    }
}
