use super::SyncError;
use crate::storage::ChangeSet;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Source of truth the mirror pulls from.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Rows changed at or after `since`, keyed by table.
    async fn fetch_changes(&self, since: i64) -> Result<ChangeSet, SyncError>;

    /// Raw bytes of one attachment.
    async fn fetch_attachment(&self, attachment_id: i64) -> Result<Vec<u8>, SyncError>;
}

#[derive(Serialize)]
struct UpdateRequest {
    last_update_time: i64,
}

/// Remote source behind the host's HTTP API (`GET /update`, `GET /file/{id}`).
#[derive(Clone)]
pub struct HttpRemoteSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteSource {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, SyncError> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch_changes(&self, since: i64) -> Result<ChangeSet, SyncError> {
        let body = UpdateRequest {
            last_update_time: since,
        };
        // checkpoint travels in both the body and the query string
        let changes = self
            .get("/update")
            .query(&body)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<ChangeSet>()
            .await?;
        debug!(since, messages = changes.message.len(), "fetched change feed");
        Ok(changes)
    }

    async fn fetch_attachment(&self, attachment_id: i64) -> Result<Vec<u8>, SyncError> {
        let bytes = self
            .get(&format!("/file/{attachment_id}"))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}
