use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

fn default_events() -> Vec<String> {
	vec!["*".to_owned()]
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
	pub url: Option<String>,
	pub secret: Option<String>,
	/// Event names to deliver; `*` matches everything.
	pub events: Vec<String>,
}

impl Default for WebhookConfig {
	fn default() -> Self {
		Self {
			url: None,
			secret: None,
			events: default_events(),
		}
	}
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
	event: &'a str,
	timestamp: DateTime<Utc>,
	data: serde_json::Value,
}

/// Fire-and-forget outbound notifications. Delivery is at-most-once:
/// failures are logged and never retried.
pub struct WebhookNotifier {
	config: WebhookConfig,
	client: reqwest::Client,
}

impl WebhookNotifier {
	pub fn new(config: WebhookConfig) -> Self {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()
			.expect("reqwest client construction is infallible here");
		Self { config, client }
	}

	pub fn disabled() -> Self {
		Self::new(WebhookConfig::default())
	}

	pub fn enabled_for(&self, event: &str) -> bool {
		self.config.url.is_some()
			&& self
				.config
				.events
				.iter()
				.any(|e| e == "*" || e == event)
	}

	pub async fn send(&self, event: &str, data: serde_json::Value) {
		if !self.enabled_for(event) {
			return;
		}
		let url = self.config.url.as_ref().expect("enabled_for checked url");
		let payload = WebhookPayload {
			event,
			timestamp: Utc::now(),
			data,
		};
		let mut request = self.client.post(url).json(&payload);
		if let Some(secret) = &self.config.secret {
			request = request.header("X-Webhook-Secret", secret);
		}
		match request.send().await {
			Ok(response) if response.status().is_success() => {
				debug!(event, "webhook delivered");
			}
			Ok(response) => warn!(event, status = %response.status(), "webhook rejected"),
			Err(e) => warn!(event, "webhook delivery failed: {e}"),
		}
	}

	/// Convenience wrapper for host-scoped events.
	pub async fn send_host_event(&self, event: &str, host: &str, data: serde_json::Value) {
		self.send(event, json!({ "host": host, "detail": data })).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wildcard_and_explicit_event_filters() {
		let all = WebhookNotifier::new(WebhookConfig {
			url: Some("https://hooks.example".to_owned()),
			..Default::default()
		});
		assert!(all.enabled_for("apply"));
		assert!(all.enabled_for("drift"));

		let drift_only = WebhookNotifier::new(WebhookConfig {
			url: Some("https://hooks.example".to_owned()),
			secret: None,
			events: vec!["drift".to_owned()],
		});
		assert!(drift_only.enabled_for("drift"));
		assert!(!drift_only.enabled_for("apply"));

		assert!(!WebhookNotifier::disabled().enabled_for("apply"));
	}
}
