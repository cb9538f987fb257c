use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;

use crate::common::{ChatMessage, RoomDescriptor};
use crate::error::{HistoryError, HistoryResult};
use crate::network::credentials::Credentials;

/// Supplier of past messages for a room.
#[async_trait]
pub trait HistorySource: Send + Sync + 'static {
    async fn fetch_history(&self, room_id: &str) -> HistoryResult<Vec<ChatMessage>>;
}

/// REST collaborator serving `/history` and `/rooms`.
#[derive(Debug, Clone)]
pub struct RestHistoryClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

impl RestHistoryClient {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self::with_client(Client::new(), base_url, credentials)
    }

    /// Client whose requests give up after `timeout`.
    pub fn with_timeout(
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> HistoryResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, base_url, credentials))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, credentials: Credentials) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            credentials,
        }
    }

    /// `GET /history` across every room.
    pub async fn fetch_all_history(&self) -> HistoryResult<Vec<ChatMessage>> {
        self.get_json(self.endpoint(&["history"])?).await
    }

    /// `GET /rooms`.
    pub async fn list_rooms(&self) -> HistoryResult<Vec<RoomDescriptor>> {
        self.get_json(self.endpoint(&["rooms"])?).await
    }

    /// Base URL extended by `segments`, each percent-encoded as one path
    /// segment.
    fn endpoint(&self, segments: &[&str]) -> HistoryResult<Url> {
        let invalid = || HistoryError::InvalidUrl(self.base_url.clone());
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> HistoryResult<T> {
        log::debug!("GET {url}");
        let response = self.authorize(self.http.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl HistorySource for RestHistoryClient {
    async fn fetch_history(&self, room_id: &str) -> HistoryResult<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> =
            self.get_json(self.endpoint(&["history", room_id])?).await?;
        for message in messages.iter_mut().filter(|message| message.room_id.is_empty()) {
            message.room_id = room_id.to_string();
        }
        Ok(messages)
    }
}
