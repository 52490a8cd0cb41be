//! # Event Relays
//!
//! Where the outbox sends newly appended events.
//!
//! The HTTP relay POSTs one JSON envelope per event:
//! ```text
//! POST <endpoint>
//! Idempotency-Key: <event id>
//! Authorization: Basic ...          (when credentials are set)
//!
//! { "aggregateId": "...", "aggregateType": "...", "event": { ... } }
//! ```
//! The receiver deduplicates on the idempotency key, so a retried relay
//! has at most one effect.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use url::Url;

use tally_core::Event;

use crate::error::{SyncError, SyncResult};

const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers one event to a remote system.
#[async_trait]
pub trait EventRelay: Send + Sync {
    async fn relay(&self, event: &Event) -> SyncResult<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    aggregate_id: &'a str,
    aggregate_type: &'a str,
    event: &'a Event,
}

/// Relays events as JSON over HTTP.
pub struct HttpRelay {
    client: Client,
    endpoint: Url,
    credentials: Option<(String, Option<String>)>,
}

impl HttpRelay {
    pub fn new(endpoint: &str, username: Option<String>, password: Option<String>) -> SyncResult<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported relay scheme '{}'",
                endpoint.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(RELAY_TIMEOUT)
            .build()
            .map_err(|e| SyncError::ConnectionFailed(e.to_string()))?;

        Ok(HttpRelay {
            client,
            endpoint,
            credentials: username.map(|user| (user, password)),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl EventRelay for HttpRelay {
    async fn relay(&self, event: &Event) -> SyncResult<()> {
        let aggregate = event
            .aggregate
            .as_ref()
            .ok_or_else(|| SyncError::RelayFailed(format!("event {} has no aggregate", event.id)))?;

        let envelope = Envelope {
            aggregate_id: &aggregate.id,
            aggregate_type: &aggregate.aggregate_type,
            event,
        };

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("Idempotency-Key", event.id.as_str())
            .json(&envelope);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RelayFailed(format!(
                "relay of {} returned {}",
                event.id, status
            )));
        }

        debug!(id = %event.id, status = status.as_u16(), "Event relayed");
        Ok(())
    }
}
