//! HTTP implementation of [`ChatTransport`] on top of reqwest.
//!
//! Routes, relative to the base URL:
//!
//! ```text
//! GET  /channels
//! GET  /channels/{channel_id}/messages?limit=&before=
//! POST /channels/{channel_id}/messages
//! POST /channels/{channel_id}/messages/{message_id}/reactions
//! POST /channels/{channel_id}/typing
//! GET  /direct/{user_id}/messages?limit=
//! POST /direct/{user_id}/messages
//! GET  /institutions/{institution_id}/roster
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use huddle_core::error::TransportError;
use huddle_core::transport::ChatTransport;
use huddle_types::api::{
    DirectPage, MessagePage, MessageQuery, MessageResponse, ReactionGroup, ReactionSetResponse,
    SendMessageRequest, SendTarget, ToggleReactionRequest,
};
use huddle_types::models::{Channel, RosterMember};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bearer-authenticated REST client for the messaging API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Network(format!("Cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token).json(body)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status();
        debug!("{} {}", status.as_u16(), response.url().path());

        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound(response.url().path().to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TransportError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("Invalid response body: {}", e)))
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn list_channels(&self) -> Result<Vec<Channel>, TransportError> {
        self.json(self.get("/channels")).await
    }

    async fn fetch_page(
        &self,
        channel_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<MessagePage, TransportError> {
        let query = MessageQuery { limit, before };
        let path = format!("/channels/{}/messages", channel_id);
        self.json(self.get(&path).query(&query)).await
    }

    async fn fetch_direct_page(&self, other_user: Uuid, limit: u32) -> Result<DirectPage, TransportError> {
        let query = MessageQuery { limit, before: None };
        let path = format!("/direct/{}/messages", other_user);
        self.json(self.get(&path).query(&query)).await
    }

    async fn send_message(
        &self,
        target: SendTarget,
        request: SendMessageRequest,
    ) -> Result<MessageResponse, TransportError> {
        let path = match target {
            SendTarget::Channel(channel_id) => format!("/channels/{}/messages", channel_id),
            SendTarget::Direct(user_id) => format!("/direct/{}/messages", user_id),
        };
        self.json(self.post(&path, &request)).await
    }

    async fn toggle_reaction(
        &self,
        channel_id: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<Vec<ReactionGroup>, TransportError> {
        let path = format!("/channels/{}/messages/{}/reactions", channel_id, message_id);
        let body = ToggleReactionRequest {
            emoji: emoji.to_string(),
        };
        let set: ReactionSetResponse = self.json(self.post(&path, &body)).await?;
        if set.message_id != message_id {
            return Err(TransportError::Rejected {
                status: StatusCode::OK.as_u16(),
                message: format!("reactions returned for message {}", set.message_id),
            });
        }
        Ok(set.reactions)
    }

    async fn fetch_roster(&self, institution_id: Uuid) -> Result<Vec<RosterMember>, TransportError> {
        self.json(self.get(&format!("/institutions/{}/roster", institution_id)))
            .await
    }

    async fn notify_typing(&self, channel_id: Uuid) -> Result<(), TransportError> {
        let path = format!("/channels/{}/typing", channel_id);
        self.send(self.http.post(self.url(&path)).bearer_auth(&self.token))
            .await
            .map(|_| ())
    }
}
