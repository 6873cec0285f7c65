use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::services::collaborators::Notifier;

/// Sends plain-text replies through the Telegram Bot API.
pub struct TelegramNotifier {
    http: Client,
    send_url: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            send_url: send_message_url(api_base, bot_token),
        })
    }
}

fn send_message_url(api_base: &str, bot_token: &str) -> String {
    format!("{}/bot{bot_token}/sendMessage", api_base.trim_end_matches('/'))
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let reply: ApiReply = self
            .http
            .post(&self.send_url)
            .json(&SendMessage { chat_id, text })
            .send()
            .await?
            .json()
            .await?;

        if reply.ok {
            Ok(())
        } else {
            Err(NotifyError::Api {
                description: reply.description.unwrap_or_else(|| "unknown error".into()),
            })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Telegram request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram rejected message: {description}")]
    Api { description: String },
}
