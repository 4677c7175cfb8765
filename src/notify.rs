//! Best-effort notification fan-out.
//!
//! After a scan is recorded, up to three destinations tied to the batch's
//! owning organization are notified: its managed-registry broadcast topic,
//! its agent's inbound channel, and its agent's outbound channel. Each send
//! runs in its own error boundary; one failure never prevents the others,
//! and failure of all three never fails the verification request. The only
//! persisted side record is an agent-message audit row for the inbound
//! send, and its write failure is likewise swallowed.

use serde_json::json;
use tracing::warn;

use crate::store::{OrganizationRecord, ScanStore};

/// Message-kind discriminator for the agent's inbound channel.
pub const KIND_AGENT_REQUEST: &str = "unit_verified_request";
/// Message-kind discriminator for the agent's outbound channel.
pub const KIND_AGENT_NOTICE: &str = "unit_verified_notice";
/// Message kind for the managed-registry broadcast.
pub const KIND_BROADCAST: &str = "unit_verified";

/// Typed outcome of one send attempt. The upstream service's submit
/// endpoint sometimes returns a sequence number and sometimes not; callers
/// never have to guess the shape.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryReceipt {
    pub delivered: bool,
    pub sequence: Option<u64>,
}

/// What happened across the whole fan-out, for logging only.
#[derive(Debug, Clone, Copy, Default)]
pub struct FanOutReport {
    pub attempted: u32,
    pub delivered: u32,
}

/// The scan event broadcast to owner-side systems.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub scan_id: i64,
    pub serial_number: String,
    pub batch_id: String,
    pub scan_result: String,
    pub region: String,
    pub timestamp: String,
}

/// Client for the topic submit API.
pub struct NotificationClient {
    base_url: String,
    client: reqwest::Client,
}

impl NotificationClient {
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Submit a message to a topic. Never returns an error: any failure is
    /// logged and reported as `delivered: false`.
    pub async fn safe_send(
        &self,
        topic_id: &str,
        payload: &serde_json::Value,
        description: &str,
    ) -> DeliveryReceipt {
        let url = format!(
            "{}/topics/{}/messages",
            self.base_url,
            urlencoding::encode(topic_id)
        );

        let response = match self.client.post(&url).json(payload).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(topic_id, description, error = %e, "notification send failed");
                return DeliveryReceipt {
                    delivered: false,
                    sequence: None,
                };
            }
        };

        if !response.status().is_success() {
            warn!(
                topic_id,
                description,
                status = %response.status(),
                "notification send rejected"
            );
            return DeliveryReceipt {
                delivered: false,
                sequence: None,
            };
        }

        // Opportunistic sequence extraction; a non-numeric or missing field
        // is not an error.
        let sequence = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("sequence_number").and_then(|s| s.as_u64()));

        DeliveryReceipt {
            delivered: true,
            sequence,
        }
    }
}

fn event_payload(event: &ScanEvent, kind: &str) -> serde_json::Value {
    json!({
        "kind": kind,
        "scan_id": event.scan_id,
        "serial_number": event.serial_number,
        "batch_id": event.batch_id,
        "scan_result": event.scan_result,
        "region": event.region,
        "timestamp": event.timestamp,
    })
}

/// Fan a scan event out to the organization's configured destinations.
///
/// Fire-and-forget semantics: the returned report is for logging and
/// metrics only and carries no error.
pub async fn fan_out_scan_event(
    client: &NotificationClient,
    store: &ScanStore,
    organization: &OrganizationRecord,
    event: &ScanEvent,
) -> FanOutReport {
    let mut report = FanOutReport::default();

    if let Some(ref topic) = organization.managed_registry_topic {
        report.attempted += 1;
        let receipt = client
            .safe_send(topic, &event_payload(event, KIND_BROADCAST), "managed registry broadcast")
            .await;
        if receipt.delivered {
            report.delivered += 1;
        }
    }

    if let Some(ref topic) = organization.agent_inbound_topic {
        report.attempted += 1;
        let receipt = client
            .safe_send(topic, &event_payload(event, KIND_AGENT_REQUEST), "agent inbound request")
            .await;
        if receipt.delivered {
            report.delivered += 1;
        }
        // Audit row only for the inbound-agent send; its failure is
        // non-critical.
        if let Err(e) = store.insert_agent_message(
            organization.id,
            event.scan_id,
            KIND_AGENT_REQUEST,
            receipt.sequence.unwrap_or(0),
        ) {
            warn!(scan_id = event.scan_id, error = %e, "agent message audit write failed");
        }
    }

    if let Some(ref topic) = organization.agent_outbound_topic {
        report.attempted += 1;
        let receipt = client
            .safe_send(topic, &event_payload(event, KIND_AGENT_NOTICE), "agent outbound notice")
            .await;
        if receipt.delivered {
            report.delivered += 1;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_scan_join_key_and_kind() {
        let event = ScanEvent {
            scan_id: 17,
            serial_number: "SER-ABC-123-0007".into(),
            batch_id: "ABC-123".into(),
            scan_result: "GENUINE".into(),
            region: "Lagos".into(),
            timestamp: "2026-03-04T14:00:00.000Z".into(),
        };
        let payload = event_payload(&event, KIND_AGENT_REQUEST);
        assert_eq!(payload["scan_id"], 17);
        assert_eq!(payload["kind"], "unit_verified_request");
        assert_eq!(payload["scan_result"], "GENUINE");
    }

    #[tokio::test]
    async fn safe_send_swallows_connection_errors() {
        // Nothing listens on this port; the send must degrade, not error.
        let client = NotificationClient::with_base_url("http://127.0.0.1:1");
        let receipt = client
            .safe_send("0.0.900", &serde_json::json!({}), "test")
            .await;
        assert!(!receipt.delivered);
        assert!(receipt.sequence.is_none());
    }

    #[tokio::test]
    async fn fan_out_with_no_configured_destinations_is_a_noop() {
        let store = crate::store::ScanStore::open_in_memory().unwrap();
        let org = OrganizationRecord {
            id: 1,
            name: "PharmaCo".into(),
            region: "Lagos".into(),
            managed_registry_topic: None,
            agent_inbound_topic: None,
            agent_outbound_topic: None,
        };
        let event = ScanEvent {
            scan_id: 1,
            serial_number: "SER-ABC-123-0007".into(),
            batch_id: "ABC-123".into(),
            scan_result: "GENUINE".into(),
            region: "Lagos".into(),
            timestamp: String::new(),
        };
        let client = NotificationClient::with_base_url("http://127.0.0.1:1");
        let report = fan_out_scan_event(&client, &store, &org, &event).await;
        assert_eq!(report.attempted, 0);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn fan_out_attempts_all_destinations_despite_failures() {
        let store = crate::store::ScanStore::open_in_memory().unwrap();
        let org = OrganizationRecord {
            id: 1,
            name: "PharmaCo".into(),
            region: "Lagos".into(),
            managed_registry_topic: Some("0.0.900".into()),
            agent_inbound_topic: Some("0.0.901".into()),
            agent_outbound_topic: Some("0.0.902".into()),
        };
        let event = ScanEvent {
            scan_id: 1,
            serial_number: "SER-ABC-123-0007".into(),
            batch_id: "ABC-123".into(),
            scan_result: "SUSPICIOUS".into(),
            region: "Lagos".into(),
            timestamp: String::new(),
        };
        // All three sends fail (dead endpoint); the fan-out still attempts
        // each and returns normally.
        let client = NotificationClient::with_base_url("http://127.0.0.1:1");
        let report = fan_out_scan_event(&client, &store, &org, &event).await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 0);
    }
}
