//! Offline alerting over store snapshots.
//!
//! A read-only store consumer, fully independent of the polling path: on a
//! fixed check interval it derives every silo's status and notifies on
//! offline/back-online transitions, with a per-silo cooldown against
//! repeats. Delivery goes through the [`Notifier`] seam; the shipped
//! implementation posts to the Telegram bot API with credentials taken
//! from the environment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{ConfigError, SiloConfig, TelegramConfig};
use crate::store::{SharedStore, SiloStatus};

/// Notification delivery failure. Never fatal to the monitor.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API rejected the message: {0}")]
    Rejected(reqwest::StatusCode),
}

/// Delivery channel for alert messages.
pub trait Notifier: Send {
    fn send(&self, text: &str) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Telegram bot notifier.
pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Build a notifier from the environment variables named in the
    /// config. The token never appears in the config file itself.
    pub fn from_env(config: &TelegramConfig) -> Result<Self, ConfigError> {
        let bot_token = std::env::var(&config.bot_token_env).map_err(|_| {
            ConfigError::Validation(format!(
                "Missing environment variable {}",
                config.bot_token_env
            ))
        })?;
        let chat_id = std::env::var(&config.chat_id_env).map_err(|_| {
            ConfigError::Validation(format!("Missing environment variable {}", config.chat_id_env))
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::Validation(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            http,
            bot_token,
            chat_id,
        })
    }
}

impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let response = self.http.post(&url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status()));
        }

        Ok(())
    }
}

/// A silo availability transition worth notifying about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    Offline {
        id: u8,
        last_update: Option<DateTime<Utc>>,
    },
    BackOnline {
        id: u8,
    },
}

/// Tracks availability transitions and applies the alert cooldown.
pub struct AlertManager<N: Notifier> {
    notifier: N,
    store: SharedStore,
    codes: BTreeMap<u8, String>,
    staleness: Duration,
    cooldown: TimeDelta,
    check_interval: Duration,
    currently_offline: HashSet<u8>,
    last_alert: HashMap<u8, DateTime<Utc>>,
}

impl<N: Notifier> AlertManager<N> {
    /// Create a manager over the given silos.
    pub fn new(
        notifier: N,
        store: SharedStore,
        silos: &[SiloConfig],
        staleness: Duration,
        cooldown: Duration,
        check_interval: Duration,
    ) -> Self {
        let codes = silos.iter().map(|s| (s.id, s.code.clone())).collect();
        Self {
            notifier,
            store,
            codes,
            staleness,
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX),
            check_interval,
            currently_offline: HashSet::new(),
            last_alert: HashMap::new(),
        }
    }

    /// Compare the current snapshot against the tracked state.
    ///
    /// An offline (or never-read) silo raises an alert when its cooldown
    /// has expired; a silo back online raises a recovery notice and
    /// re-arms its cooldown.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for (id, reading) in self.store.snapshot() {
            let status = SiloStatus::derive(reading.as_ref(), now, self.staleness);
            let was_offline = self.currently_offline.contains(&id);

            match status {
                SiloStatus::Online => {
                    if was_offline {
                        self.currently_offline.remove(&id);
                        self.last_alert.remove(&id);
                        events.push(AlertEvent::BackOnline { id });
                    }
                }
                SiloStatus::Offline | SiloStatus::NeverRead => {
                    let due = match self.last_alert.get(&id) {
                        None => true,
                        Some(at) => now.signed_duration_since(*at) >= self.cooldown,
                    };
                    if due {
                        self.last_alert.insert(id, now);
                        events.push(AlertEvent::Offline {
                            id,
                            last_update: reading.map(|r| r.timestamp),
                        });
                    }
                    self.currently_offline.insert(id);
                }
            }
        }

        events
    }

    /// Run the alert loop until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            silos = self.codes.len(),
            check_interval_secs = self.check_interval.as_secs(),
            "starting alert task"
        );
        self.dispatch(&self.startup_message()).await;

        let mut ticker = tokio::time::interval(self.check_interval);
        // interval fires immediately; skip that so the first evaluation
        // happens after the poller had a chance to complete a cycle
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let events = self.evaluate(Utc::now());
                    for event in &events {
                        let text = self.format_event(event);
                        self.dispatch(&text).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("alert task stopped");
    }

    async fn dispatch(&self, text: &str) {
        if let Err(e) = self.notifier.send(text).await {
            error!("failed to deliver alert: {}", e);
        }
    }

    fn code(&self, id: u8) -> String {
        self.codes
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("S{:02}", id))
    }

    fn startup_message(&self) -> String {
        format!(
            "🚀 <b>Silo monitor started</b>\n\n📊 <b>Silos:</b> {}\n🕐 <b>Time:</b> {}",
            self.codes.len(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    fn format_event(&self, event: &AlertEvent) -> String {
        match event {
            AlertEvent::Offline { id, last_update } => {
                let last = match last_update {
                    Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
                    None => "never".to_string(),
                };
                format!(
                    "⚠️ <b>SILO OFFLINE</b>\n\n🏷 <b>Silo:</b> {} (unit {})\n🕐 <b>Last reading:</b> {}",
                    self.code(*id),
                    id,
                    last
                )
            }
            AlertEvent::BackOnline { id } => {
                format!(
                    "✅ <b>SILO ONLINE</b>\n\n🏷 <b>Silo:</b> {} (unit {})",
                    self.code(*id),
                    id
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Reading, ReadingStore};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Notifier for RecordingNotifier {
        async fn send(&self, text: &str) -> Result<(), NotifyError> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn silo(id: u8) -> SiloConfig {
        SiloConfig {
            id,
            capacity: 28000,
            code: format!("S{:02}", id),
        }
    }

    fn manager(store: SharedStore, ids: &[u8]) -> AlertManager<RecordingNotifier> {
        let silos: Vec<SiloConfig> = ids.iter().map(|id| silo(*id)).collect();
        AlertManager::new(
            RecordingNotifier::default(),
            store,
            &silos,
            Duration::from_secs(10),
            Duration::from_secs(900),
            Duration::from_secs(60),
        )
    }

    fn reading(ts: DateTime<Utc>) -> Reading {
        Reading {
            raw_value: 14000,
            percent: 50,
            timestamp: ts,
        }
    }

    #[test]
    fn test_offline_transition_raises_once() {
        let store = Arc::new(ReadingStore::new([7]));
        store.put(7, reading(at(0)));
        let mut manager = manager(store.clone(), &[7]);

        // Fresh reading: no events.
        assert!(manager.evaluate(at(5)).is_empty());

        // Past the staleness threshold: exactly one offline alert.
        let events = manager.evaluate(at(30));
        assert_eq!(
            events,
            vec![AlertEvent::Offline {
                id: 7,
                last_update: Some(at(0))
            }]
        );

        // Still offline, inside the cooldown: silent.
        assert!(manager.evaluate(at(60)).is_empty());
    }

    #[test]
    fn test_repeat_alert_after_cooldown() {
        let store = Arc::new(ReadingStore::new([7]));
        store.put(7, reading(at(0)));
        let mut manager = manager(store.clone(), &[7]);

        assert_eq!(manager.evaluate(at(30)).len(), 1);
        // Cooldown is 900s; the next repeat fires at or after t=930.
        assert!(manager.evaluate(at(900)).is_empty());
        assert_eq!(manager.evaluate(at(930)).len(), 1);
    }

    #[test]
    fn test_recovery_notice_and_rearm() {
        let store = Arc::new(ReadingStore::new([7]));
        store.put(7, reading(at(0)));
        let mut manager = manager(store.clone(), &[7]);

        assert_eq!(manager.evaluate(at(30)).len(), 1);

        // A fresh reading flips it back: one recovery notice.
        store.put(7, reading(at(100)));
        assert_eq!(
            manager.evaluate(at(101)),
            vec![AlertEvent::BackOnline { id: 7 }]
        );

        // Going offline again alerts immediately; the cooldown was cleared.
        assert_eq!(manager.evaluate(at(200)).len(), 1);
    }

    #[test]
    fn test_never_read_counts_as_offline() {
        let store = Arc::new(ReadingStore::new([1, 2]));
        store.put(1, reading(at(95)));
        let mut manager = manager(store.clone(), &[1, 2]);

        let events = manager.evaluate(at(100));
        assert_eq!(
            events,
            vec![AlertEvent::Offline {
                id: 2,
                last_update: None
            }]
        );
    }

    #[test]
    fn test_message_formatting() {
        let store = Arc::new(ReadingStore::new([7]));
        let manager = manager(store, &[7]);

        let text = manager.format_event(&AlertEvent::Offline {
            id: 7,
            last_update: Some(at(0)),
        });
        assert!(text.contains("SILO OFFLINE"));
        assert!(text.contains("S07"));
        assert!(text.contains("unit 7"));

        let text = manager.format_event(&AlertEvent::BackOnline { id: 7 });
        assert!(text.contains("SILO ONLINE"));
    }

    #[tokio::test]
    async fn test_dispatch_records_message() {
        let store = Arc::new(ReadingStore::new([1]));
        let manager = manager(store, &[1]);
        let sent = manager.notifier.sent.clone();

        manager.dispatch("hello").await;
        assert_eq!(sent.lock().as_slice(), ["hello".to_string()]);
    }
}
