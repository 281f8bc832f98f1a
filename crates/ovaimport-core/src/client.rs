//! HTTP implementation of [`ManagementApi`] for the HyperCore REST API.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;

use crate::api::{
    AttachDiskRequest, CreateVmRequest, CreatedResource, ManagementApi, RemoteTask,
    TaskStatusResponse, TaskTag,
};
use crate::error::{Error, Result};

/// Default timeout for JSON request/response calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for one import job.
///
/// Each job builds its own client from this value; nothing is shared
/// between jobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base URL of the REST API, without a trailing slash.
    pub endpoint: String,
    pub username: String,
    pub password: SecretString,
    /// Skip TLS certificate verification (self-signed cluster certificates).
    pub accept_invalid_certs: bool,
    /// Timeout applied to every call except disk uploads.
    pub request_timeout: Duration,
}

impl ServerConfig {
    /// Create settings for `server`, which may be a bare host or a full URL.
    pub fn new(server: &str, username: impl Into<String>, password: SecretString) -> Self {
        Self {
            endpoint: normalize_endpoint(server),
            username: username.into(),
            password,
            accept_invalid_certs: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Turn `host` into `https://host/rest/v1`; URLs with a scheme are kept.
pub fn normalize_endpoint(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.contains("://") {
        server.to_string()
    } else {
        format!("https://{server}/rest/v1")
    }
}

/// Blocking HTTP client for the management API.
pub struct HyperCoreClient {
    http: Client,
    config: ServerConfig,
}

impl HyperCoreClient {
    /// Build a client for `config`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { http, config })
    }

    /// Base URL of the API.
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(
            &self.config.username,
            Some(self.config.password.expose_secret()),
        )
    }

    fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorized(request)
            .timeout(self.config.request_timeout)
            .send()?;
        decode(response)
    }
}

impl ManagementApi for HyperCoreClient {
    fn create_vm(&self, request: &CreateVmRequest) -> Result<CreatedResource> {
        tracing::debug!(name = %request.dom.name, "POST /VirDomain/");
        self.send_json(self.http.post(self.url("/VirDomain/")).json(request))
    }

    fn task_status(&self, tag: &TaskTag) -> Result<RemoteTask> {
        let url = self.url(&format!("/TaskTag/{tag}"));
        let response: TaskStatusResponse = self.send_json(self.http.get(url))?;
        Ok(response.into_task(tag))
    }

    fn upload_disk(&self, path: &Path, filename: &str, size: u64) -> Result<String> {
        tracing::debug!(filename, size, "PUT /VirtualDisk/upload");
        let file = File::open(path).map_err(|e| Error::io(e, path))?;

        // Uploads run as long as the transfer takes; no request timeout.
        let response = self
            .authorized(self.http.put(self.url("/VirtualDisk/upload")))
            .query(&[("filename", filename.to_string()), ("filesize", size.to_string())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::sized(file, size))
            .send()?;

        let created: CreatedResource = decode(response)?;
        Ok(created.created_uuid)
    }

    fn attach_disk(
        &self,
        disk_uuid: &str,
        request: &AttachDiskRequest,
    ) -> Result<CreatedResource> {
        tracing::debug!(disk_uuid, "POST /VirtualDisk/{{uuid}}/attach");
        let url = self.url(&format!("/VirtualDisk/{disk_uuid}/attach"));
        self.send_json(self.http.post(url).json(request))
    }
}

/// Check the HTTP status and decode a JSON body.
fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(status_error(status, &body));
    }

    response
        .json::<T>()
        .map_err(|e| Error::transport(format!("invalid response body: {e}")))
}

fn status_error(status: StatusCode, body: &str) -> Error {
    Error::transport(format!(
        "HTTP {} {} - {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown error"),
        body.trim()
    ))
}
