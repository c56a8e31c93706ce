use crate::api::streaming::Feed;
use crate::execution::{StreamConfig, TraderConfig};
use crate::monitor::MonitorConfig;
use crate::models::DataKind;
use crate::risk::RiskLimits;
use crate::strategy::signals::DetectorConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub anti_chase_pct: f64,
    pub family_protection_pct: f64,
    pub quick_profit_pct: f64,
    pub position_notional: f64,
    pub max_positions: usize,
    pub fill_timeout_secs: u64,
    pub fill_poll_ms: u64,
    pub wash_sale_cooldown_minutes: i64,
    pub extended_hours: bool,
}

impl Default for TradingSettings {
    fn default() -> Self {
        let limits = RiskLimits::default();
        Self {
            anti_chase_pct: limits.anti_chase_pct,
            family_protection_pct: limits.family_protection_pct,
            quick_profit_pct: limits.quick_profit_pct,
            position_notional: limits.position_notional,
            max_positions: limits.max_positions,
            fill_timeout_secs: 10,
            fill_poll_ms: 500,
            wash_sale_cooldown_minutes: 30,
            extended_hours: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TechnicalSettings {
    /// Filter window, odd, 3..=101
    pub window_len: usize,
    pub lookahead: usize,
    pub delta: f64,
    pub min_distance: usize,
    /// Bars; defaults to the window length
    pub freshness_threshold: Option<usize>,
    pub timeframe: String,
    pub history_bars: usize,
}

impl Default for TechnicalSettings {
    fn default() -> Self {
        Self {
            window_len: 11,
            lookahead: 1,
            delta: 0.0,
            min_distance: 3,
            freshness_threshold: None,
            timeframe: "1Min".to_string(),
            history_bars: 390,
        }
    }
}

impl TechnicalSettings {
    pub fn freshness(&self) -> usize {
        self.freshness_threshold.unwrap_or(self.window_len)
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            window_len: self.window_len,
            lookahead: self.lookahead,
            delta: self.delta,
            min_distance: self.min_distance,
            freshness_threshold: self.freshness(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub url: Option<String>,
    pub feed: Feed,
    pub data_kinds: Vec<DataKind>,
    /// Events kept per buffer; 0 keeps everything
    pub buffer_capacity: usize,
    /// Symbols whose buffers are never trimmed
    pub unbounded_symbols: Vec<String>,
    pub max_reconnect_attempts: u32,
    pub backoff_max_secs: u64,
    pub join_timeout_secs: u64,
    pub hibernation_enabled: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            feed: Feed::Iex,
            data_kinds: vec![DataKind::Quotes, DataKind::Trades],
            buffer_capacity: 5000,
            unbounded_symbols: Vec::new(),
            max_reconnect_attempts: 5,
            backoff_max_secs: 30,
            join_timeout_secs: 5,
            hibernation_enabled: true,
        }
    }
}

impl StreamSettings {
    pub fn capacity(&self) -> Option<usize> {
        (self.buffer_capacity > 0).then_some(self.buffer_capacity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub scan_interval_secs: u64,
    pub fast_interval_ms: u64,
    pub checkpoint_interval_secs: u64,
    /// Alert on every N-th cycle error
    pub error_alert_every: u64,
    pub max_watchlist: usize,
    pub watchlist: Vec<String>,
    /// Log a heartbeat every N fast cycles
    pub heartbeat_every: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            fast_interval_ms: 2000,
            checkpoint_interval_secs: 100,
            error_alert_every: 10,
            max_watchlist: 50,
            watchlist: Vec::new(),
            heartbeat_every: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub trading_url: Option<String>,
    pub data_url: Option<String>,
    pub call_timeout_secs: u64,
    pub requests_per_minute: u32,
    /// Starting cash for `--paper`
    pub paper_cash: f64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            trading_url: None,
            data_url: None,
            call_timeout_secs: 10,
            requests_per_minute: 200,
            paper_cash: 100_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub webhook_url: Option<String>,
    pub channel_timeout_secs: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            channel_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub backend: CheckpointBackend,
    pub path: String,
    pub redis_url: String,
    pub redis_key: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            path: "state/checkpoint.json".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_key: "autotrader:checkpoint".to_string(),
        }
    }
}

/// Full service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub trading: TradingSettings,
    pub technical: TechnicalSettings,
    pub stream: StreamSettings,
    pub monitor: MonitorSettings,
    pub broker: BrokerSettings,
    pub alerts: AlertSettings,
    pub persistence: PersistenceSettings,
}

impl Settings {
    /// Defaults, then the optional TOML file, then `AUTOTRADER__SECTION__KEY`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("AUTOTRADER")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("monitor.watchlist")
                .with_list_parse_key("stream.unbounded_symbols")
                .with_list_parse_key("stream.data_kinds")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let t = &self.technical;

        t.detector()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("technical: {}", e)))?;
        if t.history_bars < 2 * t.lookahead {
            return invalid("technical.history_bars too small for lookahead".to_string());
        }

        let tr = &self.trading;
        for (name, value) in [
            ("trading.anti_chase_pct", tr.anti_chase_pct),
            ("trading.family_protection_pct", tr.family_protection_pct),
            ("trading.quick_profit_pct", tr.quick_profit_pct),
            ("trading.position_notional", tr.position_notional),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return invalid(format!("{} must be positive, got {}", name, value));
            }
        }
        if tr.max_positions == 0 {
            return invalid("trading.max_positions must be at least 1".to_string());
        }
        if tr.fill_timeout_secs == 0 || tr.fill_poll_ms == 0 {
            return invalid("fill timeout and poll interval must be positive".to_string());
        }
        if tr.wash_sale_cooldown_minutes < 0 {
            return invalid("trading.wash_sale_cooldown_minutes must not be negative".to_string());
        }

        let m = &self.monitor;
        if m.scan_interval_secs == 0 || m.fast_interval_ms == 0 || m.checkpoint_interval_secs == 0 {
            return invalid("monitor intervals must be positive".to_string());
        }
        if m.error_alert_every == 0 {
            return invalid("monitor.error_alert_every must be at least 1".to_string());
        }

        if self.stream.data_kinds.is_empty() {
            return invalid("stream.data_kinds must not be empty".to_string());
        }
        if self.broker.call_timeout_secs == 0 || self.broker.requests_per_minute == 0 {
            return invalid("broker timeout and rate limit must be positive".to_string());
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.call_timeout_secs)
    }

    pub fn trader_config(&self) -> TraderConfig {
        let tr = &self.trading;
        TraderConfig {
            limits: RiskLimits {
                anti_chase_pct: tr.anti_chase_pct,
                family_protection_pct: tr.family_protection_pct,
                quick_profit_pct: tr.quick_profit_pct,
                position_notional: tr.position_notional,
                max_positions: tr.max_positions,
            },
            freshness_threshold: self.technical.freshness(),
            fill_timeout: Duration::from_secs(tr.fill_timeout_secs),
            fill_poll_interval: Duration::from_millis(tr.fill_poll_ms),
            call_timeout: self.call_timeout(),
            extended_hours: tr.extended_hours,
            ..TraderConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        let m = &self.monitor;
        MonitorConfig {
            scan_interval: Duration::from_secs(m.scan_interval_secs),
            fast_interval: Duration::from_millis(m.fast_interval_ms),
            checkpoint_interval: Duration::from_secs(m.checkpoint_interval_secs),
            error_alert_every: m.error_alert_every,
            heartbeat_every: m.heartbeat_every.max(1),
            max_watchlist: (m.max_watchlist > 0).then_some(m.max_watchlist),
            detector: self.technical.detector(),
            timeframe: self.technical.timeframe.clone(),
            history_bars: self.technical.history_bars,
            call_timeout: self.call_timeout(),
            feed: self.stream.feed,
            data_kinds: self.stream.data_kinds.clone(),
            watcher_drain_timeout: Duration::from_secs(self.trading.fill_timeout_secs + 5),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        let s = &self.stream;
        StreamConfig {
            buffer_capacity: s.capacity(),
            unbounded_symbols: s.unbounded_symbols.clone(),
            max_reconnect_attempts: s.max_reconnect_attempts,
            backoff_max: Duration::from_secs(s.backoff_max_secs),
            join_timeout: Duration::from_secs(s.join_timeout_secs),
            hibernation_enabled: s.hibernation_enabled,
            ..StreamConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.technical.freshness(), 11);
        assert_eq!(settings.stream.capacity(), Some(5000));
        assert_eq!(settings.trader_config().limits.max_positions, 5);
        assert_eq!(settings.monitor.checkpoint_interval_secs, 100);
        assert_eq!(settings.monitor_config().max_watchlist, Some(50));
        assert_eq!(settings.monitor_config().history_bars, 390);
        assert_eq!(settings.monitor_config().fast_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_validation_rejects_bad_window() {
        let mut settings = Settings::default();
        settings.technical.window_len = 10;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        settings.technical.window_len = 103;
        assert!(settings.validate().is_err());

        settings.technical.window_len = 11;
        settings.technical.lookahead = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_non_positive_thresholds() {
        let mut settings = Settings::default();
        settings.trading.quick_profit_pct = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.monitor.fast_interval_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_is_unbounded() {
        let mut settings = Settings::default();
        settings.stream.buffer_capacity = 0;
        assert_eq!(settings.stream_config().buffer_capacity, None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[trading]
quick_profit_pct = 4.5
max_positions = 3

[technical]
window_len = 21
freshness_threshold = 15

[stream]
feed = "sip"
buffer_capacity = 0

[monitor]
watchlist = ["AAPL", "TSLA"]
fast_interval_ms = 500
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.trading.quick_profit_pct, 4.5);
        assert_eq!(settings.trading.max_positions, 3);
        assert_eq!(settings.technical.detector().window_len, 21);
        assert_eq!(settings.technical.freshness(), 15);
        assert_eq!(settings.stream.feed, Feed::Sip);
        assert_eq!(settings.stream.capacity(), None);
        assert_eq!(settings.monitor.watchlist, vec!["AAPL", "TSLA"]);
        assert_eq!(
            settings.monitor_config().fast_interval,
            Duration::from_millis(500)
        );
        // Untouched sections keep their defaults
        assert_eq!(settings.trading.family_protection_pct, 10.0);
    }

    #[test]
    fn test_invalid_file_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[technical]\nwindow_len = 4").unwrap();

        assert!(matches!(
            Settings::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }
}
