use super::{Ack, RemoteApi};
use crate::clock::ClockService;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityProvider;
use crate::store::Collection;
use async_trait::async_trait;
use reqwest::{header, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// HTTP client for the school backend.
///
/// Collections live at `<server_url>/<collection>`: `GET` returns the full
/// snapshot, `POST` upserts one record (or an array, answered with acks) and
/// `DELETE ?<key_field>=<key>` removes one.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    identity: Arc<dyn IdentityProvider>,
    clock: Option<Arc<ClockService>>,
}

impl HttpRemote {
    pub fn new(config: &SyncConfig, identity: Arc<dyn IdentityProvider>) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            identity,
            clock: None,
        })
    }

    /// Feed server `Date` headers into the clock service
    pub fn with_clock(mut self, clock: Arc<ClockService>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn url(&self, collection: Collection) -> String {
        format!("{}/{}", self.base_url, collection.name())
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.identity.current_identity().and_then(|identity| identity.token) {
            Some(token) => req.bearer_auth(token),
            None => {
                tracing::warn!("No identity token available, sending request unauthenticated");
                req
            }
        }
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> SyncResult<Response> {
        let sent_at = self.clock.as_ref().map(|clock| clock.local_now());

        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("{} failed: {}", what, e)))?;

        if let (Some(clock), Some(sent_at)) = (&self.clock, sent_at) {
            if let Some(date) = response
                .headers()
                .get(header::DATE)
                .and_then(|value| value.to_str().ok())
            {
                clock.observe_http_date(date, sent_at, clock.local_now());
            }
        }

        Ok(response)
    }

    fn ensure_success(response: &Response, what: &str) -> SyncResult<()> {
        if !response.status().is_success() {
            return Err(SyncError::Network(format!(
                "{} failed with status: {}",
                what,
                response.status()
            )));
        }
        Ok(())
    }

    /// An unreadable body is a remote failure like any other, so the
    /// affected records stay pending and are retried.
    async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> SyncResult<T> {
        response
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("{} returned an unreadable body: {}", what, e)))
    }

    /// Whether the backend answers at all. Any HTTP status counts as reachable.
    pub async fn probe(&self) -> bool {
        match self.send(self.client.get(&self.base_url), "Probe").await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Remote unreachable");
                false
            }
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn fetch_all(&self, collection: Collection) -> SyncResult<Vec<Value>> {
        let what = format!("Fetch {}", collection);
        let response = self.send(self.client.get(self.url(collection)), &what).await?;
        Self::ensure_success(&response, &what)?;

        Self::decode(response, &what).await
    }

    async fn upsert(&self, collection: Collection, record: &Value) -> SyncResult<Option<Value>> {
        let what = format!("Upsert {}", collection);
        let response = self
            .send(self.client.post(self.url(collection)).json(record), &what)
            .await?;
        Self::ensure_success(&response, &what)?;

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        // Backends that answer with a plain message instead of the record are fine
        Ok(serde_json::from_slice(&body).ok())
    }

    async fn upsert_batch(&self, collection: Collection, records: &[Value]) -> SyncResult<Vec<Ack>> {
        let what = format!("Batch upsert {}", collection);
        let response = self
            .send(self.client.post(self.url(collection)).json(records), &what)
            .await?;
        Self::ensure_success(&response, &what)?;

        Self::decode(response, &what).await
    }

    async fn delete(&self, collection: Collection, key: &str) -> SyncResult<()> {
        let what = format!("Delete {}/{}", collection, key);
        let req = self
            .client
            .delete(self.url(collection))
            .query(&[(collection.key_field(), key)]);
        let response = self.send(req, &what).await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(collection = %collection, key, "Remote record already absent");
            return Ok(());
        }
        Self::ensure_success(&response, &what)
    }
}
