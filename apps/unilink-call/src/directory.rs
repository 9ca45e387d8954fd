//! Client for the call-lifecycle service.

use std::time::Duration;

use async_trait::async_trait;
use call_proto::CallRecord;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::config::CallConfig;
use crate::error::DirectoryError;

#[async_trait]
pub trait CallDirectory: Send + Sync {
    async fn get_call_by_id(&self, call_id: &str) -> Result<CallRecord, DirectoryError>;

    /// The caller's ongoing call, if any.
    async fn get_active_call(&self) -> Result<Option<CallRecord>, DirectoryError>;

    /// The caller's ringing call, if any.
    async fn get_pending_call(&self) -> Result<Option<CallRecord>, DirectoryError>;

    async fn end_call(&self, call_id: &str) -> Result<(), DirectoryError>;
}

pub struct HttpCallDirectory {
    client: reqwest::Client,
    config: CallConfig,
    token: String,
}

impl HttpCallDirectory {
    pub fn new(config: CallConfig, token: impl Into<String>) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        let token = token.into();
        let token = token
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .unwrap_or(token);
        Ok(Self {
            client,
            config,
            token,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, DirectoryError> {
        let url = self.config.api_url(segments)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::HttpStatus(response.status()));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl CallDirectory for HttpCallDirectory {
    async fn get_call_by_id(&self, call_id: &str) -> Result<CallRecord, DirectoryError> {
        match self.get_json(&["calls", "by-id", call_id]).await {
            Err(DirectoryError::HttpStatus(StatusCode::NOT_FOUND)) => {
                Err(DirectoryError::NotFound(call_id.to_string()))
            }
            other => other,
        }
    }

    async fn get_active_call(&self) -> Result<Option<CallRecord>, DirectoryError> {
        self.get_json(&["calls", "active"]).await
    }

    async fn get_pending_call(&self) -> Result<Option<CallRecord>, DirectoryError> {
        self.get_json(&["calls", "pending"]).await
    }

    async fn end_call(&self, call_id: &str) -> Result<(), DirectoryError> {
        let url = self.config.api_url(&["calls", "end", call_id])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

/// Looks the call up by id, then among the caller's active and pending calls.
/// The listings only count when they are about `call_id`.
pub async fn resolve_call(
    directory: &dyn CallDirectory,
    call_id: &str,
) -> Result<CallRecord, DirectoryError> {
    match directory.get_call_by_id(call_id).await {
        Ok(record) => return Ok(record),
        Err(err) => {
            tracing::warn!(
                target = "directory",
                call_id,
                error = %err,
                "call lookup by id failed, trying active/pending"
            );
        }
    }

    match directory.get_active_call().await {
        Ok(Some(record)) if record.id == call_id => return Ok(record),
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(target = "directory", call_id, error = %err, "active call lookup failed");
        }
    }

    match directory.get_pending_call().await {
        Ok(Some(record)) if record.id == call_id => Ok(record),
        Ok(_) => Err(DirectoryError::NotFound(call_id.to_string())),
        Err(err) => {
            tracing::warn!(target = "directory", call_id, error = %err, "pending call lookup failed");
            Err(DirectoryError::NotFound(call_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fakes::{FakeDirectory, call_record};

    #[tokio::test]
    async fn prefers_lookup_by_id() {
        let directory = FakeDirectory::with_call(call_record("c1", "alice", "bob"));
        let record = resolve_call(&directory, "c1").await.unwrap();
        assert_eq!(record.initiator_id, "alice");
        assert_eq!(directory.lookups(), vec!["by-id"]);
    }

    #[tokio::test]
    async fn falls_back_to_active_then_pending() {
        let directory = FakeDirectory::default();
        directory.set_active(Some(call_record("other", "x", "y")));
        directory.set_pending(Some(call_record("c1", "bob", "alice")));
        let record = resolve_call(&directory, "c1").await.unwrap();
        assert_eq!(record.initiator_id, "bob");
        assert_eq!(directory.lookups(), vec!["by-id", "active", "pending"]);
    }

    #[tokio::test]
    async fn mismatched_listings_are_not_found() {
        let directory = FakeDirectory::default();
        directory.set_active(Some(call_record("other", "x", "y")));
        let err = resolve_call(&directory, "c1").await.unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(id) if id == "c1"));
    }

    #[test]
    fn http_directory_strips_bearer_prefix() {
        let directory = HttpCallDirectory::new(CallConfig::default(), "Bearer abc").unwrap();
        assert_eq!(directory.token, "abc");
    }
}
