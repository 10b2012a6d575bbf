// In crates/engine/src/alerts.rs

use std::time::Duration;

use app_config::types::AlertSettings;

/// Best-effort operator alerting via Telegram. Disabled (and silent)
/// when unconfigured; a failed send is logged and swallowed — alerting
/// must never take the trading loop down.
pub struct Alerter {
    enabled: bool,
    bot_token: String,
    chat_id: String,
    http_client: reqwest::Client,
}

impl Alerter {
    pub fn new(settings: &AlertSettings) -> Self {
        let enabled =
            settings.enabled && !settings.bot_token.is_empty() && !settings.chat_id.is_empty();
        Self {
            enabled,
            bot_token: settings.bot_token.clone(),
            chat_id: settings.chat_id.clone(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn send(&self, text: &str) {
        if !self.enabled {
            return;
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Err(e) = self.http_client.post(&url).json(&payload).send().await {
            tracing::warn!(error = %e, "Telegram alert failed.");
        }
    }
}
