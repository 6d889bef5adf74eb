//! Slack Incoming Webhook client.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Slack caps a section block at ten fields.
const MAX_FIELDS_PER_SECTION: usize = 10;

/// Message rendered as Block Kit: a header, label/value fields and a footer.
#[derive(Debug, Clone)]
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

impl SlackMessage {
    pub fn field(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_str())
    }
}

pub struct SlackNotifier {
    webhook_url: SecretString,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: SecretString) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Post `message`. Failures are logged and never fail the run.
    pub async fn send(&self, cluster: &str, message: &SlackMessage) {
        let payload = build_blocks_payload(message);
        let result = self
            .client
            .post(self.webhook_url.expose_secret())
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(
                    cluster = cluster,
                    header = message.header.as_str(),
                    "Slack notification sent"
                );
            }
            Ok(resp) => {
                warn!(
                    cluster = cluster,
                    status = %resp.status(),
                    "Slack webhook returned non-success status"
                );
            }
            Err(e) => {
                warn!(
                    cluster = cluster,
                    error = %e,
                    "Failed to send Slack notification"
                );
            }
        }
    }
}

fn build_blocks_payload(message: &SlackMessage) -> Value {
    let header = json!({
        "type": "header",
        "text": { "type": "plain_text", "text": message.header, "emoji": true }
    });

    let fields: Vec<Value> = message
        .fields
        .iter()
        .map(|(label, value)| json!({ "type": "mrkdwn", "text": format!("*{label}*\n{value}") }))
        .collect();
    let sections = fields
        .chunks(MAX_FIELDS_PER_SECTION)
        .map(|chunk| json!({ "type": "section", "fields": chunk }));

    let footer = [
        json!({ "type": "divider" }),
        json!({
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": message.context }]
        }),
    ];

    let blocks: Vec<Value> = std::iter::once(header)
        .chain(sections)
        .chain(footer)
        .collect();

    json!({
        "text": format!("{}\n{}", message.header, message.context),
        "blocks": blocks
    })
}
