//! Docker Engine API client over a Unix domain socket.
//!
//! Every call opens its own connection, performs one HTTP/1.1 exchange with
//! `hyper`'s connection-level client and closes it. Nothing is pooled and
//! nothing is retried; each call is wrapped in a timeout from
//! [`DockerConfig`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;

use crate::config::DockerConfig;
use crate::docker::api::DockerApi;
use crate::docker::error::{DockerError, Result};
use crate::docker::types::{
    ApiErrorBody, ContainerInspect, ContainerSpec, EndpointConfig, ExecInspect, ExecSpec,
    IdResponse, NetworkConnect, NetworkSpec, VersionInfo, VolumeResponse, VolumeSpec,
};
use crate::docker::upgrade::{self, ExecConnection};

/// Label applied to every network and volume this crate creates.
pub const MANAGED_LABEL: &str = "devsandbox.managed";

enum RequestBody {
    Empty,
    Json(Vec<u8>),
    Tar(Bytes),
}

struct ApiResponse {
    status: StatusCode,
    body: Bytes,
}

/// Docker Engine client bound to one socket path and API version.
#[derive(Debug, Clone)]
pub struct DockerClient {
    config: DockerConfig,
}

impl DockerClient {
    /// Create a client. No connection is made until the first call.
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    fn versioned(&self, path: &str) -> String {
        format!("/{}{}", self.config.api_version, path)
    }

    async fn connect(&self) -> Result<UnixStream> {
        let path = &self.config.socket_path;
        tokio::time::timeout(self.config.connect_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| DockerError::Timeout {
                operation: "connect".to_string(),
                timeout: self.config.connect_timeout,
            })?
            .map_err(|e| DockerError::Connect {
                path: path.clone(),
                reason: e.to_string(),
            })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        timeout: Duration,
        operation: &str,
    ) -> Result<ApiResponse> {
        let uri = self.versioned(path);

        let exchange = async {
            let stream = self.connect().await?;
            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| DockerError::transport(operation, e))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!("Docker connection closed with error: {}", e);
                }
            });

            let mut builder = Request::builder()
                .method(method)
                .uri(uri.as_str())
                .header(header::HOST, "localhost");
            let payload = match body {
                RequestBody::Empty => Bytes::new(),
                RequestBody::Json(json) => {
                    builder = builder.header(header::CONTENT_TYPE, "application/json");
                    Bytes::from(json)
                }
                RequestBody::Tar(archive) => {
                    builder = builder.header(header::CONTENT_TYPE, "application/x-tar");
                    archive
                }
            };
            let request = builder
                .body(Full::new(payload))
                .map_err(|e| DockerError::Encode {
                    operation: operation.to_string(),
                    reason: e.to_string(),
                })?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| DockerError::transport(operation, e))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| DockerError::transport(operation, e))?
                .to_bytes();

            Ok::<_, DockerError>(ApiResponse { status, body })
        };

        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DockerError::Timeout {
                operation: operation.to_string(),
                timeout,
            })??;

        tracing::debug!(
            operation,
            path = %uri,
            status = response.status.as_u16(),
            "Docker API call"
        );
        Ok(response)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        operation: &str,
    ) -> Result<Bytes> {
        let response = self
            .send(method, path, body, self.config.request_timeout, operation)
            .await?;
        check(operation, response)
    }
}

/// Accept 2xx and 304, turn everything else into a typed API error.
fn check(operation: &str, response: ApiResponse) -> Result<Bytes> {
    if response.status.is_success() || response.status == StatusCode::NOT_MODIFIED {
        return Ok(response.body);
    }

    let message = serde_json::from_slice::<ApiErrorBody>(&response.body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&response.body).trim().to_string());

    Err(DockerError::Api {
        operation: operation.to_string(),
        status: response.status.as_u16(),
        message,
    })
}

fn encode<T: Serialize>(operation: &str, value: &T) -> Result<RequestBody> {
    serde_json::to_vec(value)
        .map(RequestBody::Json)
        .map_err(|e| DockerError::Encode {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
}

fn decode<T: DeserializeOwned>(operation: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| DockerError::protocol(operation, e))
}

/// Split `repo[:tag]` into repository and tag. Digests are passed through whole.
pub(crate) fn split_image_reference(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, None),
    }
}

/// The pull endpoint streams JSON progress lines and reports failures inline.
fn pull_stream_error(body: &[u8]) -> Option<String> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_slice::<serde_json::Value>(line).ok())
        .find_map(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
}

fn managed_labels() -> std::collections::HashMap<String, String> {
    std::collections::HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])
}

#[async_trait]
impl DockerApi for DockerClient {
    async fn ping(&self) -> Result<()> {
        self.call(Method::GET, "/_ping", RequestBody::Empty, "ping")
            .await
            .map(|_| ())
    }

    async fn version(&self) -> Result<VersionInfo> {
        let body = self
            .call(Method::GET, "/version", RequestBody::Empty, "version")
            .await?;
        decode("version", &body)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        const OP: &str = "pull image";

        let (name, tag) = split_image_reference(image);
        let mut path = format!("/images/create?fromImage={}", urlencoding::encode(name));
        if let Some(tag) = tag {
            path.push_str(&format!("&tag={}", urlencoding::encode(tag)));
        }

        tracing::info!(image = %image, "Pulling image");
        let response = self
            .send(
                Method::POST,
                &path,
                RequestBody::Empty,
                self.config.pull_timeout,
                OP,
            )
            .await?;
        let status = response.status.as_u16();
        let body = check(OP, response)?;

        if let Some(message) = pull_stream_error(&body) {
            return Err(DockerError::Api {
                operation: OP.to_string(),
                status,
                message,
            });
        }
        Ok(())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        const OP: &str = "create container";
        let path = format!("/containers/create?name={}", urlencoding::encode(name));
        let body = self.call(Method::POST, &path, encode(OP, spec)?, OP).await?;
        let created: IdResponse = decode(OP, &body)?;
        for warning in created.warnings.iter().flatten() {
            tracing::warn!(container = %name, "Docker warning: {}", warning);
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}/start", id);
        self.call(Method::POST, &path, RequestBody::Empty, "start container")
            .await
            .map(|_| ())
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        const OP: &str = "stop container";
        let path = format!("/containers/{}/stop?t={}", id, timeout_secs);
        // The daemon holds the request open for the grace period.
        let bound = self.config.request_timeout + Duration::from_secs(timeout_secs);
        let response = self
            .send(Method::POST, &path, RequestBody::Empty, bound, OP)
            .await?;
        check(OP, response).map(|_| ())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let path = format!("/containers/{}?force={}&v=true", id, force);
        self.call(Method::DELETE, &path, RequestBody::Empty, "remove container")
            .await
            .map(|_| ())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        const OP: &str = "inspect container";
        let path = format!("/containers/{}/json", id);
        let body = self.call(Method::GET, &path, RequestBody::Empty, OP).await?;
        decode(OP, &body)
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        const OP: &str = "create network";
        let spec = NetworkSpec {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            labels: managed_labels(),
        };
        let body = self
            .call(Method::POST, "/networks/create", encode(OP, &spec)?, OP)
            .await?;
        let created: IdResponse = decode(OP, &body)?;
        Ok(created.id)
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let path = format!("/networks/{}", id);
        self.call(Method::DELETE, &path, RequestBody::Empty, "remove network")
            .await
            .map(|_| ())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<()> {
        const OP: &str = "connect network";
        let path = format!("/networks/{}/connect", network);
        let body = NetworkConnect {
            container: container.to_string(),
            endpoint_config: EndpointConfig {
                aliases: aliases.to_vec(),
            },
        };
        self.call(Method::POST, &path, encode(OP, &body)?, OP)
            .await
            .map(|_| ())
    }

    async fn create_volume(&self, name: &str) -> Result<String> {
        const OP: &str = "create volume";
        let spec = VolumeSpec {
            name: name.to_string(),
            labels: managed_labels(),
        };
        let body = self
            .call(Method::POST, "/volumes/create", encode(OP, &spec)?, OP)
            .await?;
        let created: VolumeResponse = decode(OP, &body)?;
        Ok(created.name)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let path = format!("/volumes/{}", name);
        self.call(Method::DELETE, &path, RequestBody::Empty, "remove volume")
            .await
            .map(|_| ())
    }

    async fn upload_archive(&self, container: &str, path: &str, archive: Bytes) -> Result<()> {
        let uri = format!(
            "/containers/{}/archive?path={}",
            container,
            urlencoding::encode(path)
        );
        tracing::debug!(container = %container, path = %path, bytes = archive.len(), "Uploading archive");
        self.call(Method::PUT, &uri, RequestBody::Tar(archive), "upload archive")
            .await
            .map(|_| ())
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String> {
        const OP: &str = "create exec";
        let path = format!("/containers/{}/exec", container);
        let body = self
            .call(Method::POST, &path, encode(OP, &spec.to_body())?, OP)
            .await?;
        let created: IdResponse = decode(OP, &body)?;
        Ok(created.id)
    }

    async fn start_exec_stream(&self, exec_id: &str, tty: bool) -> Result<ExecConnection> {
        let stream = self.connect().await?;
        tokio::time::timeout(
            self.config.connect_timeout,
            upgrade::open(stream, &self.config.api_version, exec_id, tty),
        )
        .await
        .map_err(|_| DockerError::Timeout {
            operation: "exec upgrade".to_string(),
            timeout: self.config.connect_timeout,
        })?
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect> {
        const OP: &str = "inspect exec";
        let path = format!("/exec/{}/json", exec_id);
        let body = self.call(Method::GET, &path, RequestBody::Empty, OP).await?;
        decode(OP, &body)
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        let path = format!("/exec/{}/resize?h={}&w={}", exec_id, rows, cols);
        self.call(Method::POST, &path, RequestBody::Empty, "resize exec")
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_reference() {
        assert_eq!(split_image_reference("postgres:16"), ("postgres", Some("16")));
        assert_eq!(split_image_reference("postgres"), ("postgres", None));
        assert_eq!(
            split_image_reference("localhost:5000/team/app:dev"),
            ("localhost:5000/team/app", Some("dev"))
        );
        assert_eq!(
            split_image_reference("localhost:5000/team/app"),
            ("localhost:5000/team/app", None)
        );
        assert_eq!(
            split_image_reference("alpine@sha256:abcd"),
            ("alpine@sha256:abcd", None)
        );
    }

    #[test]
    fn test_pull_stream_error_detection() {
        let ok = b"{\"status\":\"Pulling from library/alpine\"}\n{\"status\":\"Done\"}\n";
        assert!(pull_stream_error(ok).is_none());

        let failed = b"{\"status\":\"Pulling\"}\n{\"errorDetail\":{\"message\":\"denied\"},\"error\":\"denied\"}\n";
        assert_eq!(pull_stream_error(failed).as_deref(), Some("denied"));
    }

    #[test]
    fn test_check_decodes_error_message() {
        let response = ApiResponse {
            status: StatusCode::NOT_FOUND,
            body: Bytes::from_static(b"{\"message\":\"No such container: abc\"}"),
        };
        let err = check("inspect container", response).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("No such container: abc"));
    }

    #[test]
    fn test_check_accepts_not_modified() {
        let response = ApiResponse {
            status: StatusCode::NOT_MODIFIED,
            body: Bytes::new(),
        };
        assert!(check("start container", response).is_ok());
    }

    #[test]
    fn test_versioned_path() {
        let client = DockerClient::new(DockerConfig::default());
        assert_eq!(client.versioned("/_ping"), "/v1.43/_ping");
    }
}
