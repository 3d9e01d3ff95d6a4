//! API client for the MÁV mobile ticketing service.
//!
//! This module provides the `Upstream` trait the session manager talks to and
//! `ApiClient`, its HTTP implementation. Every call validates its inputs,
//! passes the shared `RateGovernor`, then performs exactly one JSON POST.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::governor::RateGovernor;
use crate::models::{AuthGrant, TicketImage, TicketRecord};

use super::wire::{
    self, LoginRequest, OrderSearchRequest, TicketImageRequest, LOGIN_ENDPOINT,
    ORDER_SEARCH_ENDPOINT, TICKET_IMAGE_ENDPOINT,
};
use super::ApiError;

/// One operation per upstream endpoint. Implementations never let a raw
/// transport error escape: every failure is an `ApiError`.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthGrant, ApiError>;

    async fn list_orders(&self, username: &str, token: &str)
        -> Result<Vec<TicketRecord>, ApiError>;

    async fn fetch_ticket_image(
        &self,
        username: &str,
        token: &str,
        document_id: &str,
    ) -> Result<TicketImage, ApiError>;
}

/// HTTP client for the ticketing service.
/// Clone is cheap - reqwest::Client and the governor are shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    config: UpstreamConfig,
    governor: Arc<RateGovernor>,
}

fn require(value: &str, what: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        Err(ApiError::Validation(format!("{} is required", what)))
    } else {
        Ok(())
    }
}

impl ApiClient {
    pub fn new(config: UpstreamConfig, governor: Arc<RateGovernor>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            governor,
        })
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// Admit through the governor, then send one POST and read the body.
    async fn post<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<(StatusCode, String), ApiError> {
        if !self.governor.admit() {
            warn!(
                endpoint,
                max_requests = self.governor.max_requests(),
                window_secs = self.governor.window().as_secs(),
                "Outbound request denied by rate governor"
            );
            return Err(ApiError::RateLimited);
        }

        let url = self.endpoint_url(endpoint);
        debug!(endpoint, "Sending upstream request");

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(ApiError::transport)?;

        let status = response.status();
        let text = response.text().await.map_err(ApiError::transport)?;
        debug!(endpoint, status = status.as_u16(), bytes = text.len(), "Upstream responded");
        Ok((status, text))
    }
}

#[async_trait]
impl Upstream for ApiClient {
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthGrant, ApiError> {
        require(username, "Username")?;
        require(password, "Password")?;

        let request = LoginRequest {
            username,
            password,
            language: &self.config.language,
            client_id: &self.config.client_id,
        };
        let (status, body) = self.post(LOGIN_ENDPOINT, &request).await?;
        wire::interpret_login(status, &body)
    }

    async fn list_orders(
        &self,
        username: &str,
        token: &str,
    ) -> Result<Vec<TicketRecord>, ApiError> {
        require(username, "Username")?;
        require(token, "Token")?;

        let request = OrderSearchRequest {
            valid_only: true,
            username,
            token,
            language: &self.config.language,
            client_id: &self.config.client_id,
        };
        let (status, body) = self.post(ORDER_SEARCH_ENDPOINT, &request).await?;
        let tickets = wire::interpret_orders(status, &body)?;
        debug!(count = tickets.len(), "Tickets listed");
        Ok(tickets)
    }

    async fn fetch_ticket_image(
        &self,
        username: &str,
        token: &str,
        document_id: &str,
    ) -> Result<TicketImage, ApiError> {
        require(username, "Username")?;
        require(token, "Token")?;
        require(document_id, "Document id")?;

        let request = TicketImageRequest {
            username,
            document_ids: vec![document_id],
            token,
            language: &self.config.language,
            client_id: &self.config.client_id,
        };
        let (status, body) = self.post(TICKET_IMAGE_ENDPOINT, &request).await?;
        wire::interpret_ticket_image(status, &body, document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernorConfig;

    fn client_with_budget(max_requests: usize) -> ApiClient {
        let governor = Arc::new(RateGovernor::new(GovernorConfig {
            max_requests,
            window: Duration::from_secs(3600),
        }));
        // Unroutable address: any request that slips past the checks fails fast
        let config = UpstreamConfig {
            base_url: "http://127.0.0.1:9".into(),
            request_timeout_secs: 1,
            ..UpstreamConfig::default()
        };
        ApiClient::new(config, governor).expect("client builds")
    }

    #[test]
    fn test_endpoint_url_joins_cleanly() {
        let mut client = client_with_budget(1);
        client.config.base_url = "https://example.test/rest/".into();
        assert_eq!(client.endpoint_url("GetJegykep"), "https://example.test/rest/GetJegykep");
    }

    #[tokio::test]
    async fn test_validation_fails_before_governor() {
        let client = client_with_budget(1);
        let err = client.authenticate("", "secret").await.unwrap_err();
        assert_eq!(err, ApiError::Validation("Username is required".into()));
        let err = client.fetch_ticket_image("alice", "tok", " ").await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        // Nothing was recorded against the budget
        assert_eq!(client.governor().in_window(), 0);
    }

    #[tokio::test]
    async fn test_denied_request_does_no_io() {
        let client = client_with_budget(0);
        let err = client.list_orders("alice", "tok").await.unwrap_err();
        assert_eq!(err, ApiError::RateLimited);
        assert_eq!(err.status(), 429);
    }

    #[tokio::test]
    async fn test_connection_failure_is_transport_error() {
        let client = client_with_budget(5);
        let err = client.authenticate("alice", "secret").await.unwrap_err();
        assert!(matches!(err, ApiError::UpstreamTransport { status: None, .. }));
        assert_eq!(client.governor().in_window(), 1);
    }
}
