use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::models::job::ChatId;

/// The chat front-end as seen by the gateway.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), ChatError>;

    async fn send_text_with_quote(
        &self,
        chat_id: ChatId,
        text: &str,
        quoted_msg_id: i64,
    ) -> Result<(), ChatError>;

    /// Download a file sent by a user into `dest_dir`, returning the local path.
    async fn download_photo(&self, file_id: &str, dest_dir: &Path) -> Result<PathBuf, ChatError>;

    async fn delete_webhook(&self) -> Result<(), ChatError>;

    /// Currently registered webhook URL; empty when none is set.
    async fn webhook_url(&self) -> Result<String, ChatError>;

    async fn set_webhook(&self, url: &str) -> Result<(), ChatError>;

    /// Bot account name, used as a credentials check at start-up.
    async fn bot_username(&self) -> Result<String, ChatError>;
}

/// Telegram Bot API client.
pub struct TelegramClient {
    http: Client,
    api_url: String,
    token: String,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

#[derive(Deserialize)]
struct WebhookInfo {
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct BotUser {
    username: Option<String>,
    first_name: String,
}

impl TelegramClient {
    pub fn new(api_url: &str, token: &str) -> Result<Self, ChatError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(ChatError::Http)?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChatError> {
        let url = format!("{}/bot{}/{}", self.api_url, self.token, method);
        let response: ApiResponse<T> = self
            .http
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(ChatError::Http)?
            .json()
            .await
            .map_err(ChatError::Http)?;

        match (response.ok, response.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(ChatError::Api {
                method: method.to_string(),
                description: response
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), ChatError> {
        self.call::<serde_json::Value>(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn send_text_with_quote(
        &self,
        chat_id: ChatId,
        text: &str,
        quoted_msg_id: i64,
    ) -> Result<(), ChatError> {
        self.call::<serde_json::Value>(
            "sendMessage",
            serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "reply_to_message_id": quoted_msg_id,
            }),
        )
        .await?;
        Ok(())
    }

    async fn download_photo(&self, file_id: &str, dest_dir: &Path) -> Result<PathBuf, ChatError> {
        let info: FileInfo = self
            .call("getFile", serde_json::json!({ "file_id": file_id }))
            .await?;
        let remote_path = info
            .file_path
            .ok_or_else(|| ChatError::UnsafePath(format!("no file_path for {file_id}")))?;
        let local_path = dest_dir.join(safe_relative_path(&remote_path)?);

        let url = format!("{}/file/bot{}/{}", self.api_url, self.token, remote_path);
        let data = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(ChatError::Http)?
            .bytes()
            .await
            .map_err(ChatError::Http)?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local_path, &data).await?;
        Ok(local_path)
    }

    async fn delete_webhook(&self) -> Result<(), ChatError> {
        self.call::<bool>("deleteWebhook", serde_json::json!({})).await?;
        Ok(())
    }

    async fn webhook_url(&self) -> Result<String, ChatError> {
        let info: WebhookInfo = self.call("getWebhookInfo", serde_json::json!({})).await?;
        Ok(info.url)
    }

    async fn set_webhook(&self, url: &str) -> Result<(), ChatError> {
        self.call::<bool>(
            "setWebhook",
            serde_json::json!({ "url": url, "max_connections": 40 }),
        )
        .await?;
        Ok(())
    }

    async fn bot_username(&self) -> Result<String, ChatError> {
        let me: BotUser = self.call("getMe", serde_json::json!({})).await?;
        Ok(me.username.unwrap_or(me.first_name))
    }
}

/// Only plain relative components are accepted, so a server-supplied path can
/// never escape the download directory.
fn safe_relative_path(remote: &str) -> Result<PathBuf, ChatError> {
    let path = Path::new(remote);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            _ => return Err(ChatError::UnsafePath(remote.to_string())),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ChatError::UnsafePath(remote.to_string()));
    }
    Ok(out)
}

/// Replace whatever webhook is registered with `url`.
///
/// The old webhook is removed first, then the API is polled until it reports
/// no webhook before the new one is set. Gives up after `timeout`.
pub async fn register_webhook(
    chat: &dyn ChatClient,
    url: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), ChatError> {
    let deadline = Instant::now() + timeout;

    chat.delete_webhook().await?;
    loop {
        match chat.webhook_url().await {
            Ok(current) if current.is_empty() => break,
            Ok(current) => {
                tracing::debug!(current = %current, "Previous webhook still registered");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Webhook readiness check failed");
            }
        }
        if Instant::now() >= deadline {
            return Err(ChatError::NotReady(timeout));
        }
        sleep(poll_interval).await;
    }

    chat.set_webhook(url).await?;
    tracing::info!("Webhook registered");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat API call {method} failed: {description}")]
    Api { method: String, description: String },

    #[error("refusing file path {0:?}")]
    UnsafePath(String),

    #[error("chat API not ready after {0:?}")]
    NotReady(Duration),

    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}
