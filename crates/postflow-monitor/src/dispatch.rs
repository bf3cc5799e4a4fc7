//! Alert dispatch: sends fired alerts to the configured notification targets.
//! Supports: Telegram Bot API, Discord Webhook, HTTP Webhook.

use postflow_core::config::NotifyConfig;

use crate::alerts::{Alert, AlertSeverity};

/// Notification target configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyTarget {
    /// Telegram Bot API: send via `sendMessage`.
    Telegram { bot_token: String, chat_id: String },
    /// Discord Webhook URL.
    Discord { webhook_url: String },
    /// Generic HTTP webhook: POST with the alert as JSON.
    Webhook { url: String },
}

impl NotifyTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyTarget::Telegram { .. } => "telegram",
            NotifyTarget::Discord { .. } => "discord",
            NotifyTarget::Webhook { .. } => "webhook",
        }
    }
}

/// Dispatch an alert to one target.
pub async fn dispatch(client: &reqwest::Client, alert: &Alert, target: &NotifyTarget) -> Result<(), String> {
    match target {
        NotifyTarget::Telegram { bot_token, chat_id } => send_telegram(client, bot_token, chat_id, alert).await,
        NotifyTarget::Discord { webhook_url } => send_discord(client, webhook_url, alert).await,
        NotifyTarget::Webhook { url } => send_webhook(client, url, alert).await,
    }
}

async fn send_telegram(
    client: &reqwest::Client,
    bot_token: &str,
    chat_id: &str,
    alert: &Alert,
) -> Result<(), String> {
    let url = format!("https://api.telegram.org/bot{}/sendMessage", bot_token);
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "chat_id": chat_id,
            "text": telegram_text(alert),
            "parse_mode": "Markdown"
        }))
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| format!("Telegram send failed: {}", e.without_url()))?;

    if resp.status().is_success() {
        tracing::info!("✅ Telegram alert sent: {}", alert.rule_id);
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(format!("Telegram API error {status}: {body}"))
    }
}

fn telegram_text(alert: &Alert) -> String {
    format!(
        "{} *{}* ({})\n\n{}\n\n_Health {}/100 • {}_",
        alert.severity.emoji(),
        escape_markdown(&alert.rule_name),
        alert.severity.as_str(),
        escape_markdown(&alert.message),
        alert.health_score,
        alert.fired_at.format("%H:%M:%S UTC")
    )
}

async fn send_discord(client: &reqwest::Client, webhook_url: &str, alert: &Alert) -> Result<(), String> {
    let resp = client
        .post(webhook_url)
        .json(&serde_json::json!({
            "embeds": [{
                "title": format!("{} {}", alert.severity.emoji(), alert.rule_name),
                "description": alert.message,
                "color": severity_color(alert.severity),
                "footer": {
                    "text": format!("Health {}/100 • {}", alert.health_score, alert.fired_at.format("%H:%M:%S UTC"))
                }
            }]
        }))
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| format!("Discord send failed: {}", e.without_url()))?;

    if resp.status().is_success() {
        tracing::info!("✅ Discord alert sent: {}", alert.rule_id);
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(format!("Discord webhook error {status}: {body}"))
    }
}

fn severity_color(severity: AlertSeverity) -> u32 {
    match severity {
        AlertSeverity::Critical => 0xFF0000, // Red
        AlertSeverity::High => 0xFF8800,     // Orange
        AlertSeverity::Medium => 0x00AAFF,   // Blue
        AlertSeverity::Low => 0x888888,      // Gray
    }
}

async fn send_webhook(client: &reqwest::Client, url: &str, alert: &Alert) -> Result<(), String> {
    let resp = client
        .post(url)
        .json(alert)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| format!("Webhook send failed: {}", e.without_url()))?;

    if resp.status().is_success() {
        tracing::info!("✅ Webhook alert sent: {}", alert.rule_id);
        Ok(())
    } else {
        Err(format!("Webhook error {}", resp.status()))
    }
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

/// Dispatch to every target. Failures are logged and returned, never raised.
pub async fn dispatch_all(
    client: &reqwest::Client,
    alert: &Alert,
    targets: &[NotifyTarget],
) -> Vec<(&'static str, Result<(), String>)> {
    let mut results = Vec::new();
    for target in targets {
        let result = dispatch(client, alert, target).await;
        if let Err(e) = &result {
            tracing::warn!("⚠️ Alert dispatch to {} failed: {}", target.kind(), e);
        }
        results.push((target.kind(), result));
    }
    results
}

/// Build targets from the `[monitoring.notify]` section. Empty values are skipped.
pub fn targets_from_config(config: &NotifyConfig) -> Vec<NotifyTarget> {
    let set = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
    let mut targets = Vec::new();

    if let (Some(bot_token), Some(chat_id)) = (set(&config.telegram_bot_token), set(&config.telegram_chat_id)) {
        targets.push(NotifyTarget::Telegram { bot_token, chat_id });
    }
    if let Some(webhook_url) = set(&config.discord_webhook_url) {
        targets.push(NotifyTarget::Discord { webhook_url });
    }
    if let Some(url) = set(&config.webhook_url) {
        targets.push(NotifyTarget::Webhook { url });
    }
    targets
}
