//! REST adapter for the session API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | session row | `GET {api}/sessions/{id}` |
//! | document | `GET {api}/sessions/{id}/document` (404 = none yet) |
//! | save | `PATCH {api}/sessions/{id}/document` |
//! | roster | `GET {api}/sessions/{id}/participants` |
//! | media grant | `POST {grant}/sessions/{id}/media-token` |
//! | profile | `GET {api}/profiles/{id}` (404 = unknown) |

use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    GrantIssuer, Profile, ProfileLookup, RosterEntry, SessionRow, SessionStore, StoredDocument,
};
use crate::error::StoreError;
use crate::media::MediaGrant;
use crate::protocol::{ParticipantId, SessionId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: Client,
    api_url: String,
    grant_url: String,
}

#[derive(Serialize)]
struct GrantRequest {
    participant_id: ParticipantId,
}

impl HttpSessionApi {
    pub fn new(api_url: impl Into<String>, grant_url: Option<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Request(e.to_string()))?;
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let grant_url = grant_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| api_url.clone());
        Ok(Self {
            client,
            api_url,
            grant_url,
        })
    }

    pub fn session_url(&self, session_id: SessionId) -> String {
        format!("{}/sessions/{session_id}", self.api_url)
    }

    pub fn document_url(&self, session_id: SessionId) -> String {
        format!("{}/document", self.session_url(session_id))
    }

    pub fn roster_url(&self, session_id: SessionId) -> String {
        format!("{}/participants", self.session_url(session_id))
    }

    pub fn grant_endpoint(&self, session_id: SessionId) -> String {
        format!("{}/sessions/{session_id}/media-token", self.grant_url)
    }

    pub fn profile_url(&self, participant_id: ParticipantId) -> String {
        format!("{}/profiles/{participant_id}", self.api_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<Option<T>, StoreError> {
        let response = self.client.get(&url).send().await.map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = checked(response, &url)?
            .json::<T>()
            .await
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(body))
    }
}

fn request_error(e: reqwest::Error) -> StoreError {
    StoreError::Request(e.to_string())
}

fn checked(response: Response, url: &str) -> Result<Response, StoreError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(StoreError::Status {
            status: response.status().as_u16(),
            url: url.to_string(),
        })
    }
}

impl SessionStore for HttpSessionApi {
    fn fetch_session(&self, session_id: SessionId) -> BoxFuture<'_, Result<SessionRow, StoreError>> {
        Box::pin(async move {
            self.get_json(self.session_url(session_id))
                .await?
                .ok_or(StoreError::NotFound(session_id))
        })
    }

    fn fetch_document(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, Result<Option<StoredDocument>, StoreError>> {
        Box::pin(async move { self.get_json(self.document_url(session_id)).await })
    }

    fn save_document(
        &self,
        session_id: SessionId,
        document: StoredDocument,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let url = self.document_url(session_id);
            let response = self
                .client
                .patch(&url)
                .json(&document)
                .send()
                .await
                .map_err(request_error)?;
            checked(response, &url)?;
            log::debug!("Saved document for session {session_id}");
            Ok(())
        })
    }

    fn fetch_roster(&self, session_id: SessionId) -> BoxFuture<'_, Result<Vec<RosterEntry>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .get_json(self.roster_url(session_id))
                .await?
                .unwrap_or_default())
        })
    }
}

impl GrantIssuer for HttpSessionApi {
    fn issue_grant(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, Result<MediaGrant, StoreError>> {
        Box::pin(async move {
            let url = self.grant_endpoint(session_id);
            let response = self
                .client
                .post(&url)
                .json(&GrantRequest { participant_id })
                .send()
                .await
                .map_err(request_error)?;
            checked(response, &url)?
                .json::<MediaGrant>()
                .await
                .map_err(|e| StoreError::Serialization(e.to_string()))
        })
    }
}

impl ProfileLookup for HttpSessionApi {
    fn lookup_profile(
        &self,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, Result<Option<Profile>, StoreError>> {
        Box::pin(async move { self.get_json(self.profile_url(participant_id)).await })
    }
}
