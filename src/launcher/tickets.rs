//! Ticket-service client.
//!
//! Every admitted phase gets its own isolated ticket in the external
//! tracker; no parent ticket exists. The poster is a trait so tests and
//! ticketless deployments run with the noop implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::models::Phase;

/// Per-call timeout for the ticket service.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload for one phase's ticket.
#[derive(Debug, Clone, Serialize)]
pub struct TicketRequest {
    /// Stable external id; the service deduplicates on it, making retried
    /// creation idempotent.
    pub external_id: String,
    pub title: String,
    pub body: String,
}

impl TicketRequest {
    /// Build the payload from the phase's title, prompt, and position
    /// within its feature.
    pub fn for_phase(phase: &Phase, total_phases: i64) -> Self {
        Self {
            external_id: phase.phase_id.clone(),
            title: format!(
                "[feature {} · {}/{}] {}",
                phase.feature_id, phase.phase_number, total_phases, phase.title
            ),
            body: phase.prompt.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket_ref: String,
}

#[async_trait]
pub trait TicketPoster: Send + Sync {
    /// Create (or re-fetch, on retry) the ticket for a phase and return
    /// its opaque reference.
    async fn create_ticket(&self, request: &TicketRequest) -> Result<String>;
}

/// HTTP poster against the configured ticket service.
pub struct HttpTicketPoster {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTicketPoster {
    pub fn new(base_url: String, token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build ticket-service HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl TicketPoster for HttpTicketPoster {
    async fn create_ticket(&self, request: &TicketRequest) -> Result<String> {
        let url = format!("{}/tickets", self.base_url);
        let resp: TicketResponse = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(request)
            .send()
            .await
            .context("Failed to send ticket request")?
            .error_for_status()
            .context("Ticket service returned error status")?
            .json()
            .await
            .context("Failed to parse ticket response")?;
        Ok(resp.ticket_ref)
    }
}

/// Poster for deployments without a ticket service: mints a local ref so
/// the launch record stays complete.
pub struct NoopTicketPoster;

#[async_trait]
impl TicketPoster for NoopTicketPoster {
    async fn create_ticket(&self, request: &TicketRequest) -> Result<String> {
        Ok(format!(
            "local-{}-{}",
            request.external_id,
            Uuid::new_v4().simple()
        ))
    }
}
