//! Registry client for batch event-log topics.
//!
//! Every batch carries a reference to an append-only registry topic holding
//! its full lifecycle history (creation, transfers, flags). On each scan the
//! service re-reads the topic's complete history with no caching, so the rule
//! engine always sees fresh state. Messages carry a free-form `metadata`
//! string; only entries that parse as JSON with `type == "EVENT_LOG"` are
//! structured lifecycle events, everything else is dropped as noise.

use eyre::{bail, Result, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sentinel `type` tag marking a structured event-log entry.
pub const EVENT_LOG_TYPE: &str = "EVENT_LOG";

/// Page size for topic history fetches.
const PAGE_LIMIT: u32 = 100;

/// Hard cap on pages followed per topic. A mirror that keeps handing out
/// cursors past this is broken; erroring beats scanning against a silently
/// truncated history.
const MAX_TOPIC_PAGES: u32 = 1_000;

/// One raw message published to a registry topic.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicMessage {
    #[serde(default)]
    pub sequence_number: u64,
    /// Free-form payload; event-log entries are JSON strings.
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub consensus_timestamp: String,
}

/// One page of topic history.
#[derive(Debug, Deserialize)]
struct TopicMessagesPage {
    #[serde(default)]
    messages: Vec<TopicMessage>,
    /// Cursor for the next page, absent on the last page.
    #[serde(default)]
    next: Option<String>,
}

/// A parsed, sentinel-tagged lifecycle event for a batch.
///
/// Fields beyond `kind`/`event` are optional; publishers attach only what
/// the event needs, and the rule engine checks fields defensively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Must equal [`EVENT_LOG_TYPE`] for the entry to be kept.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event discriminator, e.g. `BATCH_CREATED`, `OWNERSHIP_TRANSFER`,
    /// `BATCH_FLAGGED`.
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub unit_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

/// Filter raw topic messages down to parsed event-log entries.
///
/// Per-entry parse failures and entries without the [`EVENT_LOG_TYPE`] tag
/// are silently dropped: noise on the topic must never abort processing of
/// the remaining history.
pub fn parse_event_entries(messages: &[TopicMessage]) -> Vec<EventLogEntry> {
    messages
        .iter()
        .filter_map(|m| serde_json::from_str::<EventLogEntry>(&m.metadata).ok())
        .filter(|e| e.kind == EVENT_LOG_TYPE)
        .collect()
}

/// Client for the registry mirror API.
pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RegistryClient {
    /// Create a client against the given mirror base URL.
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch the **full** message history of a topic, oldest first.
    ///
    /// Follows the page cursor until exhausted; a scan must never operate on
    /// a truncated history.
    pub async fn fetch_topic_messages(&self, topic_id: &str) -> Result<Vec<TopicMessage>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages: u32 = 0;

        loop {
            let mut url = format!(
                "{}/topics/{}/messages?limit={}",
                self.base_url,
                urlencoding::encode(topic_id),
                PAGE_LIMIT
            );
            if let Some(ref c) = cursor {
                url.push_str(&format!("&cursor={}", urlencoding::encode(c)));
            }

            let page: TopicMessagesPage = self
                .client
                .get(&url)
                .send()
                .await
                .wrap_err_with(|| format!("Failed to reach registry for topic {topic_id}"))?
                .error_for_status()
                .wrap_err_with(|| format!("Registry error fetching topic {topic_id}"))?
                .json()
                .await
                .wrap_err("Failed to parse registry topic page")?;

            all.extend(page.messages);
            pages += 1;

            match page.next {
                Some(next) if !next.is_empty() => {
                    // A mirror echoing the cursor it was just given would
                    // loop forever.
                    if cursor.as_deref() == Some(next.as_str()) {
                        bail!("Registry returned a repeating page cursor for topic {topic_id}");
                    }
                    if pages >= MAX_TOPIC_PAGES {
                        bail!("Topic {topic_id} history exceeded {MAX_TOPIC_PAGES} pages");
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        debug!(topic_id, messages = all.len(), "fetched topic history");
        Ok(all)
    }

    /// Fetch and parse the structured event log for a batch topic.
    pub async fn fetch_event_log(&self, topic_id: &str) -> Result<Vec<EventLogEntry>> {
        let messages = self.fetch_topic_messages(topic_id).await?;
        let entries = parse_event_entries(&messages);
        debug!(
            topic_id,
            raw = messages.len(),
            kept = entries.len(),
            "parsed event log"
        );
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(metadata: &str) -> TopicMessage {
        TopicMessage {
            sequence_number: 1,
            metadata: metadata.to_string(),
            consensus_timestamp: String::new(),
        }
    }

    #[test]
    fn keeps_only_sentinel_tagged_entries() {
        let messages = vec![
            msg(r#"{"type":"EVENT_LOG","event":"BATCH_CREATED","batch_id":"ABC-123"}"#),
            msg(r#"{"type":"CHAT","event":"hello"}"#),
            msg(r#"{"type":"EVENT_LOG","event":"OWNERSHIP_TRANSFER"}"#),
        ];
        let entries = parse_event_entries(&messages);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "BATCH_CREATED");
        assert_eq!(entries[0].batch_id.as_deref(), Some("ABC-123"));
        assert_eq!(entries[1].event, "OWNERSHIP_TRANSFER");
    }

    #[test]
    fn parse_failures_are_dropped_not_fatal() {
        let messages = vec![
            msg("not json at all"),
            msg(r#"{"unterminated": "#),
            msg(""),
            msg(r#"{"type":"EVENT_LOG","event":"BATCH_CREATED"}"#),
        ];
        let entries = parse_event_entries(&messages);
        assert_eq!(entries.len(), 1, "garbage entries must not abort the batch");
    }

    #[test]
    fn entry_tolerates_missing_optional_fields() {
        let entries = parse_event_entries(&[msg(r#"{"type":"EVENT_LOG"}"#)]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "");
        assert!(entries[0].batch_id.is_none());
        assert!(entries[0].unit_id.is_none());
    }

    #[tokio::test]
    async fn repeating_cursor_aborts_instead_of_looping() {
        use axum::routing::get;
        use axum::{Json, Router};

        // A broken mirror that hands back the same cursor on every page.
        let router = Router::new().route(
            "/topics/{topic_id}/messages",
            get(|| async { Json(serde_json::json!({ "messages": [], "next": "again" })) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let client = RegistryClient::with_base_url(&format!("http://{addr}"));
        let err = client.fetch_topic_messages("0.0.100").await.unwrap_err();
        assert!(
            err.to_string().contains("repeating page cursor"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn page_deserialization() {
        let json = r#"{
            "messages": [
                {"sequence_number": 1, "metadata": "{}", "consensus_timestamp": "1700000000.1"}
            ],
            "next": "cursor-2"
        }"#;
        let page: TopicMessagesPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.next.as_deref(), Some("cursor-2"));

        let last: TopicMessagesPage = serde_json::from_str(r#"{"messages": []}"#).unwrap();
        assert!(last.next.is_none());
    }
}
