use async_trait::async_trait;
use log::{debug, error, warn};
use serde::Deserialize;
use std::{collections::VecDeque, time::Duration};
use tokio::time::sleep;

use super::{EventConnection, EventSource};
use crate::amount::AmountInput;
use crate::types::{RawEvent, RelayError, SourceConfig, SourceEventId};

/// Event envelope as served by the Dubhe indexer. The payload is decoded in a
/// second step so an item with a bad payload still yields its id.
#[derive(Debug, Deserialize)]
struct IndexerEnvelope {
    #[serde(default)]
    name: String,
    id: SourceEventId,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AssetMovedValue {
    chain_address: String,
    amount: AmountInput,
    #[serde(default)]
    origin_chain: Option<String>,
    #[serde(default, alias = "sender")]
    origin_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventPage {
    events: Vec<serde_json::Value>,
}

/// Decode one page item. Anything with a readable id comes back as an event,
/// malformed or not; only id-less items are dropped.
fn decode_item(item: serde_json::Value) -> Option<RawEvent> {
    let envelope = match serde_json::from_value::<IndexerEnvelope>(item) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("Dropping indexer item without a readable event id: {}", e);
            return None;
        }
    };

    match serde_json::from_value::<AssetMovedValue>(envelope.value) {
        Ok(value) => Some(RawEvent {
            name: envelope.name,
            id: envelope.id,
            origin_chain: value.origin_chain,
            origin_address: value.origin_address,
            chain_address: value.chain_address,
            amount: value.amount,
            malformed: None,
        }),
        Err(e) => {
            warn!(
                "Event {} ({}) has an undecodable payload: {}",
                envelope.id, envelope.name, e
            );
            Some(RawEvent::malformed(envelope.name, envelope.id, e.to_string()))
        }
    }
}

/// Polls `GET {indexer_url}/events?names=..&after=..&limit=..`
pub struct HttpIndexerSource {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    poll_interval: Duration,
}

impl HttpIndexerSource {
    pub fn new(config: &SourceConfig) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RelayError::Config(format!("Invalid indexer client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.indexer_url.trim_end_matches('/').to_string(),
            page_size: config.page_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }
}

#[async_trait]
impl EventSource for HttpIndexerSource {
    async fn connect(
        &self,
        event_names: &[String],
        resume_after: Option<SourceEventId>,
    ) -> Result<Box<dyn EventConnection>, RelayError> {
        let mut connection = HttpIndexerConnection {
            client: self.client.clone(),
            url: format!("{}/events", self.base_url),
            names: event_names.join(","),
            cursor: resume_after,
            page_size: self.page_size,
            poll_interval: self.poll_interval,
            buffered: VecDeque::new(),
            idle: false,
        };
        // first page doubles as the connectivity check
        connection.fetch_page().await?;
        Ok(Box::new(connection))
    }
}

struct HttpIndexerConnection {
    client: reqwest::Client,
    url: String,
    names: String,
    cursor: Option<SourceEventId>,
    page_size: u32,
    poll_interval: Duration,
    buffered: VecDeque<RawEvent>,
    /// Set when the last page was short or gave nothing to deliver
    idle: bool,
}

impl HttpIndexerConnection {
    /// Fetch the next page after the cursor. Returns the number of items the indexer sent.
    async fn fetch_page(&mut self) -> Result<usize, RelayError> {
        let mut query = vec![
            ("names", self.names.clone()),
            ("limit", self.page_size.to_string()),
        ];
        if let Some(cursor) = self.cursor {
            query.push(("after", cursor.to_string()));
        }

        let response = self.client.get(&self.url).query(&query).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Transport(format!(
                "indexer returned status {}: {}",
                status, body
            )));
        }

        let page: EventPage = response
            .json()
            .await
            .map_err(|e| RelayError::Transport(format!("failed to read indexer page: {}", e)))?;

        let received = page.events.len();
        let mut delivered = 0;
        for item in page.events {
            if let Some(event) = decode_item(item) {
                self.cursor = self.cursor.max(Some(event.id));
                self.buffered.push_back(event);
                delivered += 1;
            }
        }
        self.idle = received < self.page_size as usize || delivered == 0;

        debug!(
            "Indexer page: {} items, cursor now {:?}",
            received,
            self.cursor.map(|c| c.to_string())
        );
        Ok(received)
    }
}

#[async_trait]
impl EventConnection for HttpIndexerConnection {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, RelayError> {
        loop {
            if let Some(event) = self.buffered.pop_front() {
                return Ok(Some(event));
            }
            if self.idle {
                sleep(self.poll_interval).await;
            }
            self.fetch_page().await?;
        }
    }
}
