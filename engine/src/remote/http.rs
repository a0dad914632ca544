//! HTTP transport for [`RemoteApi`].

use super::{
    ErrorBody, MutationBody, RemoteApi, RemoteEntity, RemoteError, SubmitRequest,
    DEVICE_ID_HEADER, IDEMPOTENCY_KEY_HEADER,
};
use crate::operation::{EntityKey, OperationKind};
use reqwest::header::{AUTHORIZATION, IF_MATCH};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::sync::RwLock;
use std::time::Duration;

/// Talks to the system of record over HTTP/JSON.
#[derive(Debug)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpRemote {
    /// Create a client for `base_url` (e.g. `https://counts.example.com/api`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            token: RwLock::new(None),
        }
    }

    /// Install (or clear) the bearer token, e.g. after re-authentication.
    pub fn set_token(&self, token: Option<String>) {
        let mut guard = self
            .token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = token;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self
            .token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }
}

/// Method and path of each operation kind, relative to the base URL.
pub fn endpoint(kind: &OperationKind) -> (Method, String) {
    match kind {
        OperationKind::ApproveVariance(op) => (
            Method::POST,
            format!("/sessions/{}/items/{}/approve", op.session_id, op.item_id),
        ),
        OperationKind::RequestRecount(op) => (
            Method::POST,
            format!("/sessions/{}/items/{}/recount", op.session_id, op.item_id),
        ),
        OperationKind::UpdateCount(op) => (
            Method::PUT,
            format!("/sessions/{}/items/{}/count", op.session_id, op.item_id),
        ),
        OperationKind::CreateNote(op) => (Method::POST, format!("/sessions/{}/notes", op.session_id)),
        OperationKind::DeleteNote(op) => (
            Method::DELETE,
            format!("/sessions/{}/notes/{}", op.session_id, op.note_id),
        ),
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

async fn decode_entity(response: Response) -> Result<RemoteEntity, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<RemoteEntity>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()));
    }

    let body = response.json::<ErrorBody>().await.unwrap_or_default();
    Err(RemoteError::from_status(status.as_u16(), body))
}

impl RemoteApi for HttpRemote {
    async fn submit(&self, request: SubmitRequest) -> Result<RemoteEntity, RemoteError> {
        let (method, path) = endpoint(&request.operation);

        tracing::debug!(
            method = %method,
            path = %path,
            idempotency_key = %request.idempotency_key,
            base_version = request.base_version,
            "Submitting operation"
        );

        let builder = self
            .client
            .request(method, self.url(&path))
            .header(IDEMPOTENCY_KEY_HEADER, &request.idempotency_key)
            .header(IF_MATCH, request.base_version.to_string())
            .header(DEVICE_ID_HEADER, &request.device_id)
            .json(&MutationBody {
                base_version: request.base_version,
                payload: request.operation,
            });

        let response = self.authorize(builder).send().await?;
        decode_entity(response).await
    }

    async fn fetch(&self, key: &EntityKey) -> Result<Option<RemoteEntity>, RemoteError> {
        let path = format!("/entities/{}/{}", key.entity_type, key.entity_id);
        let builder = self.client.get(self.url(&path));
        let response = self.authorize(builder).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode_entity(response).await.map(Some)
    }
}
