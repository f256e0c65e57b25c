//! Operator notifications: always logged, optionally pushed to a chat webhook
//! and/or Telegram. Delivery failures are logged and never interrupt trading.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::models::{ExitReason, TradeSide};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    BotStarted {
        profile: String,
        mode: String,
        symbols: Vec<String>,
    },
    BotStopped {
        reason: String,
    },
    TradeOpened {
        symbol: String,
        side: TradeSide,
        quantity: Decimal,
        price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        strength: f64,
    },
    PartialExit {
        symbol: String,
        level: u8,
        quantity: Decimal,
        price: Decimal,
        pnl: Decimal,
    },
    TradeClosed {
        symbol: String,
        side: TradeSide,
        reason: ExitReason,
        pnl: Decimal,
        pnl_pct: Decimal,
    },
    CircuitBreaker {
        reason: String,
    },
    Error {
        context: String,
        message: String,
    },
}

impl NotificationEvent {
    fn is_alert(&self) -> bool {
        matches!(
            self,
            NotificationEvent::CircuitBreaker { .. } | NotificationEvent::Error { .. }
        )
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationEvent::BotStarted {
                profile,
                mode,
                symbols,
            } => write!(
                f,
                "Bot started ({} profile, {}) on {}",
                profile,
                mode,
                symbols.join(", ")
            ),
            NotificationEvent::BotStopped { reason } => write!(f, "Bot stopped: {}", reason),
            NotificationEvent::TradeOpened {
                symbol,
                side,
                quantity,
                price,
                stop_loss,
                take_profit,
                strength,
            } => write!(
                f,
                "Opened {} {} {} @ {} (SL {}, TP {}, strength {:.2})",
                side, quantity, symbol, price, stop_loss, take_profit, strength
            ),
            NotificationEvent::PartialExit {
                symbol,
                level,
                quantity,
                price,
                pnl,
            } => write!(
                f,
                "TP{} hit on {}: sold {} @ {} (PnL {:+.2})",
                level, symbol, quantity, price, pnl
            ),
            NotificationEvent::TradeClosed {
                symbol,
                side,
                reason,
                pnl,
                pnl_pct,
            } => write!(
                f,
                "Closed {} {} ({}): PnL {:+.2} ({:+.2}%)",
                side, symbol, reason, pnl, pnl_pct
            ),
            NotificationEvent::CircuitBreaker { reason } => {
                write!(f, "CIRCUIT BREAKER: {}", reason)
            }
            NotificationEvent::Error { context, message } => {
                write!(f, "Error in {}: {}", context, message)
            }
        }
    }
}

/// Where notifications go besides the log.
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    /// Slack-style incoming webhook (`{"text": ...}`)
    pub webhook_url: Option<String>,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

pub struct Notifier {
    client: Client,
    webhook_url: Option<String>,
    telegram: Option<(String, String)>,
    telegram_base: String,
}

impl Notifier {
    pub fn new(config: NotifierConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        let telegram = match (config.telegram_token, config.telegram_chat_id) {
            (Some(token), Some(chat)) => Some((token, chat)),
            (Some(_), None) | (None, Some(_)) => {
                warn!("Telegram needs both a token and a chat id; Telegram disabled");
                None
            }
            (None, None) => None,
        };
        Ok(Self {
            client,
            webhook_url: config.webhook_url,
            telegram,
            telegram_base: TELEGRAM_API.to_string(),
        })
    }

    pub async fn notify(&self, event: NotificationEvent) {
        let text = event.to_string();
        if event.is_alert() {
            warn!(notification = %text, "Notification");
        } else {
            info!(notification = %text, "Notification");
        }

        if let Some(url) = &self.webhook_url {
            if let Err(e) = self.send_webhook(url, &text).await {
                warn!(error = %e, "Webhook notification failed");
            }
        }
        if let Some((token, chat_id)) = &self.telegram {
            if let Err(e) = self.send_telegram(token, chat_id, &text).await {
                warn!(error = %e, "Telegram notification failed");
            }
        }
    }

    async fn send_webhook(&self, url: &str, text: &str) -> Result<()> {
        debug!("Posting webhook notification");
        let response = self
            .client
            .post(url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .context("Failed to post webhook")?;
        if !response.status().is_success() {
            anyhow::bail!("Webhook returned {}", response.status());
        }
        Ok(())
    }

    async fn send_telegram(&self, token: &str, chat_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.telegram_base, token);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .context("Failed to post Telegram message")?;
        if !response.status().is_success() {
            anyhow::bail!("Telegram returned {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_closed_message() {
        let event = NotificationEvent::TradeClosed {
            symbol: "BTCUSDT".into(),
            side: TradeSide::Buy,
            reason: ExitReason::StopLoss,
            pnl: dec!(-52.4),
            pnl_pct: dec!(-2.62),
        };
        assert_eq!(
            event.to_string(),
            "Closed BUY BTCUSDT (stop-loss): PnL -52.40 (-2.62%)"
        );
    }

    #[test]
    fn test_partial_exit_message() {
        let event = NotificationEvent::PartialExit {
            symbol: "ETHUSDT".into(),
            level: 2,
            quantity: dec!(0.4),
            price: dec!(3100),
            pnl: dec!(38.5),
        };
        assert_eq!(event.to_string(), "TP2 hit on ETHUSDT: sold 0.4 @ 3100 (PnL +38.50)");
    }

    #[test]
    fn test_alert_classification() {
        assert!(NotificationEvent::CircuitBreaker { reason: "dd".into() }.is_alert());
        assert!(!NotificationEvent::BotStopped { reason: "ctrl-c".into() }.is_alert());
    }

    #[tokio::test]
    async fn test_log_only_notifier_never_fails() {
        let notifier = Notifier::new(NotifierConfig::default()).unwrap();
        notifier
            .notify(NotificationEvent::BotStarted {
                profile: "swing".into(),
                mode: "dry-run".into(),
                symbols: vec!["BTCUSDT".into()],
            })
            .await;
    }
}
