//! Object store client.
//!
//! Talks to the remote blob store over HTTP with a static bearer token:
//! - `GET  <base>/<namespace>/?list=1` lists the namespace
//! - `GET  <base>/<namespace>/<name>` streams an object back
//! - `PUT  <base>/<namespace>/<name>` uploads a fully buffered object
//! - `DELETE <base>/<namespace>/<name>` removes an object

use crate::config::{StoreConfig, TransferConfig};
use crate::transfer::progress::capped_percent;
use crate::transfer::progress_stream::{chunked, ByteCallback, ProgressStream};
use crate::utils::errors::{Result, SyncError};
use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Characters left alone by URI component encoding
const NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Upper bound for buffer preallocation from an advertised Content-Length
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

/// Callback receiving transfer percentages (0-100)
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// One object in the store listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    /// Store-qualified key (`<namespace>/<name>`)
    pub key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub etag: String,
    #[serde(rename = "lastModified", default)]
    pub last_modified_ms: i64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Option<Vec<RemoteItem>>,
}

/// Authenticated client for one namespace of the object store
#[derive(Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    stream_downloads: bool,
    upload_chunk_size: usize,
}

impl StoreClient {
    /// Build a client; the token is attached to every request.
    pub fn new(store: &StoreConfig, transfer: &TransferConfig) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", store.token.trim()))
            .map_err(|_| SyncError::Config("store.token is not a valid header value".to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = transfer.timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: store.base_url.trim_end_matches('/').to_string(),
            namespace: store.namespace.trim_matches('/').to_string(),
            stream_downloads: transfer.stream_downloads,
            upload_chunk_size: transfer.upload_chunk_size,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn index_url(&self) -> String {
        format!("{}/{}/?list=1", self.base_url, self.namespace)
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            self.namespace,
            utf8_percent_encode(name, NAME_ENCODE_SET)
        )
    }

    /// List every object in the namespace.
    ///
    /// A listing without `items` is an empty namespace, not an error.
    pub async fn list(&self) -> Result<Vec<RemoteItem>> {
        let url = self.index_url();
        debug!("Listing {}", url);

        let response = self.http.get(&url).send().await?;
        let response = ensure_success(response, "list backups").await?;
        let listing: ListResponse = response.json().await?;
        let items = listing.items.unwrap_or_default();

        debug!("Listed {} objects", items.len());
        Ok(items)
    }

    /// Download an object, reporting progress as the body arrives.
    pub async fn get(&self, name: &str, on_progress: Option<ProgressCallback>) -> Result<Bytes> {
        let url = self.object_url(name);
        debug!("Downloading {}", url);

        let response = self.http.get(&url).send().await?;
        let response = ensure_success(response, &format!("download {}", name)).await?;

        if !self.stream_downloads {
            let body = response.bytes().await?;
            report(&on_progress, 100);
            info!("Downloaded {} bytes: {}", body.len(), name);
            return Ok(body);
        }

        let total = response.content_length().unwrap_or(0);
        let mut buffer = BytesMut::with_capacity(total.min(MAX_PREALLOC) as usize);
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            buffer.extend_from_slice(&chunk);
            if let Some(percent) = capped_percent(buffer.len() as u64, total) {
                report(&on_progress, percent);
            }
        }

        report(&on_progress, 100);
        info!("Downloaded {} bytes: {}", buffer.len(), name);
        Ok(buffer.freeze())
    }

    /// Upload an object. Any transport failure or non-2xx status fails the
    /// whole upload; nothing is resumed.
    pub async fn put(
        &self,
        name: &str,
        content: Bytes,
        on_progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let url = self.object_url(name);
        let total = content.len() as u64;
        debug!("Uploading {} bytes to {}", total, url);

        let sent_progress = on_progress.clone();
        let callback: ByteCallback = Arc::new(move |sent| {
            if let Some(percent) = capped_percent(sent, total) {
                report(&sent_progress, percent);
            }
        });

        let chunks = chunked(content, self.upload_chunk_size);
        let body = ProgressStream::new(
            stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>)),
            callback,
        );

        let response = self
            .http
            .put(&url)
            .header(CONTENT_LENGTH, total)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        ensure_success(response, &format!("upload {}", name)).await?;

        report(&on_progress, 100);
        info!("Uploaded {} bytes: {}", total, name);
        Ok(())
    }

    /// Delete an object. The store's answer is not inspected beyond
    /// logging, so deleting a missing object succeeds.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let url = self.object_url(name);
        debug!("Deleting {}", url);

        let response = self.http.delete(&url).send().await?;
        if !response.status().is_success() {
            warn!("Delete of {} answered with status {}", name, response.status());
        }
        Ok(())
    }
}

fn report(on_progress: &Option<ProgressCallback>, percent: u8) {
    if let Some(callback) = on_progress {
        callback(percent);
    }
}

async fn ensure_success(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_default();
    warn!("Failed to {}: status {} {}", action, status, error_text);
    Err(SyncError::Network(format!(
        "failed to {}: {} {}",
        action,
        status,
        error_text.trim()
    )))
}
