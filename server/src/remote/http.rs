//! Remote store over a JSON document API.
//!
//! Endpoints, relative to the base URL:
//! - `PUT    collections/{collection}/documents/{id}` with `{"fields": ...}`,
//!   answers `{"version": n}`
//! - `DELETE collections/{collection}/documents/{id}`
//! - `GET    collections/{collection}/documents/{id}`
//! - `GET    collections/{collection}/documents?since={version}` answers `{"documents": [...]}`
//!   with every document (tombstones included) whose version is greater than `since`
//! - `GET    health`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use stowage_engine::{Document, Fields, Version};
use tokio::sync::mpsc;

use super::{FeedEvent, RemoteError, RemoteStore, FEED_BUFFER};

#[derive(Serialize)]
struct WriteRequest<'a> {
    fields: &'a Fields,
}

#[derive(Deserialize)]
struct WriteResponse {
    version: Version,
}

/// A page of changes; tombstones mark deletions.
#[derive(Deserialize)]
struct ChangesResponse {
    documents: Vec<Document>,
}

/// HTTP client for the remote document API.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base: Url,
    poll_interval: Duration,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, RemoteError> {
        let base = Url::parse(base_url)
            .map_err(|e| RemoteError::Rejected(format!("invalid remote url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::Rejected(format!(
                "remote url {base_url} cannot be a base"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base,
            poll_interval,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn document_url(&self, collection: &str, id: &str) -> Url {
        self.url(&["collections", collection, "documents", id])
    }

    async fn changes_since(
        &self,
        collection: &str,
        since: Option<Version>,
    ) -> Result<Vec<Document>, RemoteError> {
        let mut url = self.url(&["collections", collection, "documents"]);
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", &since.to_string());
        }

        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let response = check_status(response, collection).await?;
        let page: ChangesResponse = response.json().await.map_err(transport_error)?;
        Ok(page.documents)
    }

    /// Poll the change endpoint until the receiver goes away or a call fails.
    async fn poll_feed(self, collection: String, tx: mpsc::Sender<FeedEvent>) {
        let mut since: Option<Version> = None;

        loop {
            let event = match self.changes_since(&collection, since).await {
                Ok(documents) => {
                    let newest = documents.iter().map(|doc| doc.version).max();
                    let event = match since {
                        None => Some(FeedEvent::Snapshot(documents)),
                        Some(_) if documents.is_empty() => None,
                        Some(_) => Some(FeedEvent::Changed(documents)),
                    };
                    since = since.max(newest).or(Some(0));
                    event
                }
                Err(err) => {
                    tracing::debug!(%collection, error = %err, "change poll failed");
                    let _ = tx.send(FeedEvent::Error(err)).await;
                    return;
                }
            };

            if let Some(event) = event {
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_decode() {
        RemoteError::Rejected(format!("malformed response: {err}"))
    } else {
        RemoteError::Unavailable(err.to_string())
    }
}

/// Map a non-success status onto the error taxonomy.
pub(crate) fn status_error(status: StatusCode, context: &str, body: String) -> RemoteError {
    let detail = if body.is_empty() {
        format!("{context}: {status}")
    } else {
        format!("{context}: {status}: {body}")
    };
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Unavailable(detail),
        StatusCode::NOT_FOUND => RemoteError::NotFound(detail),
        StatusCode::CONFLICT => RemoteError::Conflict(detail),
        s if s.is_server_error() => RemoteError::Unavailable(detail),
        _ => RemoteError::Rejected(detail),
    }
}

async fn check_status(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, context, body))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn write_document(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
    ) -> Result<Version, RemoteError> {
        let response = self
            .client
            .put(self.document_url(collection, id))
            .json(&WriteRequest { fields })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, &format!("{collection}/{id}")).await?;
        let body: WriteResponse = response.json().await.map_err(transport_error)?;
        Ok(body.version)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.document_url(collection, id))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, &format!("{collection}/{id}")).await?;
        Ok(())
    }

    async fn fetch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, RemoteError> {
        let response = self
            .client
            .get(self.document_url(collection, id))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, &format!("{collection}/{id}")).await?;
        let document: Document = response.json().await.map_err(transport_error)?;
        Ok(Some(document))
    }

    async fn subscribe(&self, collection: &str) -> Result<mpsc::Receiver<FeedEvent>, RemoteError> {
        // Only hand out a feed while the remote answers.
        self.ping().await?;

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        tokio::spawn(self.clone().poll_feed(collection.to_string(), tx));
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let response = self
            .client
            .get(self.url(&["health"]))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, "health").await?;
        Ok(())
    }
}
