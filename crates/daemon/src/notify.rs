use async_trait::async_trait;

/// Admin-facing notifications, fire and forget. Delivery failures never
/// propagate to the caller.
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify_admin(&self, text: &str);
}

/// Fallback sink: the admin channel is the service log.
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify_admin(&self, text: &str) {
        tracing::warn!("admin notice: {text}");
    }
}

/// Delivery through a Telegram bot chat.
pub struct TelegramNotifier {
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Built only when both TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID are set.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        Some(Self { token, chat_id })
    }
}

#[async_trait]
impl AdminNotifier for TelegramNotifier {
    async fn notify_admin(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let result = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => tracing::warn!("telegram notify failed: http {}", resp.status()),
            Err(e) => tracing::warn!("telegram notify failed: {e}"),
        }
    }
}
