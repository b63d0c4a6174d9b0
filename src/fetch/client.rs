//! Authenticated HTTP client for one external source.
//!
//! An [`ApiClient`] wraps a pooled `reqwest::Client` together with the
//! source's base URL and credentials. Paths are joined onto the base URL;
//! absolute URLs (such as next-page links or web pages) are used as-is.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::multipart::Form;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::FetchError;
use crate::user_agent::default_api_user_agent;

/// HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// HTTP read timeout (5 minutes, attachments can be large).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Credentials attached to every request.
#[derive(Clone, Default)]
pub enum Auth {
    /// No authentication header.
    #[default]
    None,
    /// HTTP Basic with a user name and API token.
    Basic {
        /// Account user name (usually an email address).
        user: String,
        /// API token used as the password.
        token: String,
    },
    /// `Authorization: Bearer <key>`.
    Bearer(String),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Basic { user, .. } => write!(f, "Basic({user}, <redacted>)"),
            Self::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

/// HTTP client bound to one source.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Option<Url>,
    auth: Auth,
}

impl ApiClient {
    /// Creates a client for `base_url` using the default API User-Agent.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] if `base_url` does not parse, or
    /// [`FetchError::Network`] if the underlying client cannot be built.
    pub fn new(base_url: &str, auth: Auth) -> Result<Self, FetchError> {
        let base = Url::parse(base_url).map_err(|_| FetchError::invalid_url(base_url))?;
        Self::build(Some(base), auth, &default_api_user_agent())
    }

    /// Creates a client with no base URL, for fetching absolute URLs only.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Network`] if the underlying client cannot be built.
    pub fn unbound(user_agent: &str) -> Result<Self, FetchError> {
        Self::build(None, Auth::None, user_agent)
    }

    fn build(base_url: Option<Url>, auth: Auth, user_agent: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .user_agent(user_agent)
            .gzip(true)
            .build()
            .map_err(|e| FetchError::network("<client builder>", e))?;
        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    /// Base URL requests are resolved against, if any.
    #[must_use]
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Resolves a path or absolute URL into a full URL.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] when the input is neither an absolute
    /// URL nor a path that joins onto the base URL.
    pub fn resolve(&self, path_or_url: &str) -> Result<Url, FetchError> {
        if let Ok(absolute) = Url::parse(path_or_url) {
            return Ok(absolute);
        }
        self.base_url
            .as_ref()
            .and_then(|base| base.join(path_or_url).ok())
            .ok_or_else(|| FetchError::invalid_url(path_or_url))
    }

    /// Resolves `path` and appends percent-encoded query pairs.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub fn url_with_query(&self, path: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let mut url = self.resolve(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.into())
    }

    /// GETs a JSON document.
    ///
    /// # Errors
    ///
    /// [`FetchError::HttpStatus`] on a non-2xx response and
    /// [`FetchError::MalformedResponse`] when the body does not decode as `T`.
    #[instrument(skip(self), fields(path = %path_or_url))]
    pub async fn get_json<T: DeserializeOwned>(&self, path_or_url: &str) -> Result<T, FetchError> {
        self.get_json_with_headers(path_or_url, HeaderMap::new())
            .await
    }

    /// GETs a JSON document with extra request headers.
    ///
    /// # Errors
    ///
    /// See [`get_json`](Self::get_json).
    pub async fn get_json_with_headers<T: DeserializeOwned>(
        &self,
        path_or_url: &str,
        headers: HeaderMap,
    ) -> Result<T, FetchError> {
        let url = self.resolve(path_or_url)?;
        let request = self.client.get(url.clone()).headers(headers);
        let response = self.send(request, url.as_str()).await?;
        decode_json(response, url.as_str()).await
    }

    /// GETs a response body as text.
    ///
    /// # Errors
    ///
    /// [`FetchError::HttpStatus`] on a non-2xx response.
    #[instrument(skip(self), fields(path = %path_or_url))]
    pub async fn get_text(&self, path_or_url: &str) -> Result<String, FetchError> {
        let url = self.resolve(path_or_url)?;
        let response = self.send(self.client.get(url.clone()), url.as_str()).await?;
        response
            .text()
            .await
            .map_err(|e| FetchError::network(url.as_str(), e))
    }

    /// Streams a response body into `destination`, returning the bytes written.
    ///
    /// A partially written file is removed when streaming fails.
    ///
    /// # Errors
    ///
    /// [`FetchError::HttpStatus`] on a non-2xx response, [`FetchError::Io`]
    /// when the file cannot be written.
    #[instrument(skip(self), fields(path = %path_or_url, dest = %destination.display()))]
    pub async fn download_to_file(
        &self,
        path_or_url: &str,
        destination: &Path,
    ) -> Result<u64, FetchError> {
        let url = self.resolve(path_or_url)?;
        let response = self.send(self.client.get(url.clone()), url.as_str()).await?;

        let mut file = File::create(destination)
            .await
            .map_err(|e| FetchError::io(destination, e))?;
        let result = stream_to_file(&mut file, response, url.as_str(), destination).await;
        if result.is_err() {
            debug!(path = %destination.display(), "cleaning up partial file after error");
            let _ = tokio::fs::remove_file(destination).await;
        }
        result
    }

    /// Sends a DELETE request.
    ///
    /// # Errors
    ///
    /// [`FetchError::HttpStatus`] on a non-2xx response.
    #[instrument(skip(self), fields(path = %path_or_url))]
    pub async fn delete(&self, path_or_url: &str) -> Result<(), FetchError> {
        let url = self.resolve(path_or_url)?;
        self.send(self.client.delete(url.clone()), url.as_str())
            .await?;
        Ok(())
    }

    /// POSTs a multipart form and decodes the JSON reply.
    ///
    /// # Errors
    ///
    /// See [`get_json`](Self::get_json).
    pub async fn post_multipart<T: DeserializeOwned>(
        &self,
        path_or_url: &str,
        form: Form,
    ) -> Result<T, FetchError> {
        let url = self.resolve(path_or_url)?;
        let request = self.client.post(url.clone()).multipart(form);
        let response = self.send(request, url.as_str()).await?;
        decode_json(response, url.as_str()).await
    }

    /// POSTs a raw body with the given content type and decodes the JSON reply.
    ///
    /// # Errors
    ///
    /// See [`get_json`](Self::get_json).
    pub async fn post_bytes<T: DeserializeOwned>(
        &self,
        path_or_url: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<T, FetchError> {
        let url = self.resolve(path_or_url)?;
        let request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, content_type)
            .body(body);
        let response = self.send(request, url.as_str()).await?;
        decode_json(response, url.as_str()).await
    }

    /// POSTs `body` as JSON and decodes the JSON reply.
    ///
    /// # Errors
    ///
    /// See [`get_json`](Self::get_json).
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path_or_url: &str,
        body: &B,
    ) -> Result<T, FetchError> {
        let url = self.resolve(path_or_url)?;
        let request = self.client.post(url.clone()).json(body);
        let response = self.send(request, url.as_str()).await?;
        decode_json(response, url.as_str()).await
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, FetchError> {
        let request = match &self.auth {
            Auth::None => request,
            Auth::Basic { user, token } => request.basic_auth(user, Some(token)),
            Auth::Bearer(key) => request.bearer_auth(key),
        };
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(url, status = status.as_u16(), "non-success status");
            return Err(FetchError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, FetchError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::network(url, e))?;
    serde_json::from_slice(&bytes).map_err(|e| FetchError::malformed(url, e.to_string()))
}

async fn stream_to_file(
    file: &mut File,
    response: Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, FetchError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| FetchError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(file_path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| FetchError::io(file_path, e))?;

    Ok(bytes_written)
}
