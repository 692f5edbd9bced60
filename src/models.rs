//! Core data model: wire envelope, event/state enums, configuration.
//!
//! The broker treats every numeric payload field as an opaque string; nothing
//! in this module parses prices or volumes.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{env, time::Duration};

/// Timestamp layout used everywhere on the wire and in the `orders` table.
/// Fixed-width UTC so lexicographic order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Maximum accepted `source_id` length. Longer ids are rejected, not truncated.
pub const MAX_SOURCE_ID_LEN: usize = 64;
pub const MAX_SYMBOL_LEN: usize = 20;
pub const MAX_EVENT_TYPE_LEN: usize = 50;
pub const MAX_COMMENT_LEN: usize = 500;

/// Trade lifecycle event tags recognised by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PositionOpened,
    PositionClosed,
    PositionModified,
    PendingOrderCreated,
    PendingOrderCancelled,
    PendingOrderFilled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PositionOpened => "POSITION_OPENED",
            EventType::PositionClosed => "POSITION_CLOSED",
            EventType::PositionModified => "POSITION_MODIFIED",
            EventType::PendingOrderCreated => "PENDING_ORDER_CREATED",
            EventType::PendingOrderCancelled => "PENDING_ORDER_CANCELLED",
            EventType::PendingOrderFilled => "PENDING_ORDER_FILLED",
        }
    }

    /// Exact-case match against the recognised set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POSITION_OPENED" => Some(EventType::PositionOpened),
            "POSITION_CLOSED" => Some(EventType::PositionClosed),
            "POSITION_MODIFIED" => Some(EventType::PositionModified),
            "PENDING_ORDER_CREATED" => Some(EventType::PendingOrderCreated),
            "PENDING_ORDER_CANCELLED" => Some(EventType::PendingOrderCancelled),
            "PENDING_ORDER_FILLED" => Some(EventType::PendingOrderFilled),
            _ => None,
        }
    }
}

/// Queue state of a stored event. `done` is terminal except for retention GC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Claimed,
    Done,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Claimed => "claimed",
            OrderState::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderState::Pending),
            "claimed" => Some(OrderState::Claimed),
            "done" => Some(OrderState::Done),
            _ => None,
        }
    }
}

/// Opaque trade payload. All numeric values travel as strings so the broker
/// preserves the producer's exact formatting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    #[serde(default)]
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_profit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// The event envelope as it arrives on the wire. Unknown fields are ignored
/// by serde; missing fields default so validation can produce uniform error
/// messages instead of serde's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(flatten)]
    pub payload: OrderPayload,
}

/// A validated, sanitised event ready for the storage engine.
#[derive(Debug, Clone)]
pub struct NewOrderEvent {
    pub source_id: String,
    pub event_type: EventType,
    /// Normalised to [`TIMESTAMP_FORMAT`].
    pub timestamp: String,
    pub payload: OrderPayload,
}

/// Full stored row, serialised flat so consumers see the wire envelope plus
/// the widened operator read model (state, retry bookkeeping).
#[derive(Debug, Clone, Serialize)]
pub struct StoredOrder {
    pub id: String,
    pub source_id: String,
    pub event_type: EventType,
    pub timestamp: String,
    #[serde(flatten)]
    pub payload: OrderPayload,
    pub state: OrderState,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<i64>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<i64>,
}

/// Ticket reconciliation record, written by the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketMapping {
    pub source_ticket: String,
    pub slave_ticket: String,
    pub symbol: String,
    /// Numeric carried as string, same rule as payload fields.
    pub size: String,
    pub created_at: i64,
}

/// Strip everything outside printable ASCII (32–126). Applied to every
/// client-supplied string before persistence and before logging.
pub fn sanitize(s: &str) -> String {
    s.chars().filter(|c| (' '..='~').contains(c)).collect()
}

/// Sanitise then cap at `max` characters.
pub fn sanitize_capped(s: &str, max: usize) -> String {
    let mut clean = sanitize(s);
    clean.truncate(max);
    clean
}

fn sanitize_opt(s: Option<String>, max: usize) -> Option<String> {
    s.map(|v| sanitize_capped(&v, max)).filter(|v| !v.is_empty())
}

/// Depth of a parsed JSON tree. Scalars are depth 1.
pub fn json_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}

/// Parse an ISO-8601 timestamp and re-render it in the canonical layout.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
    Some(
        parsed
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Canonical timestamp string for `now - window`, used for the recent-count
/// comparison against stored producer timestamps.
pub fn timestamp_cutoff(window: Duration) -> String {
    let cutoff = Utc::now()
        - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(0));
    format_timestamp(cutoff)
}

/// Validate a wire envelope into a storable event.
///
/// Length policy per the contract: `symbol`, `event_type` and `comment` are
/// truncated; `source_id` over 64 characters is rejected. All strings are
/// sanitised first.
pub fn validate_envelope(envelope: OrderEnvelope) -> Result<NewOrderEvent, String> {
    let source_id = sanitize(&envelope.source_id);
    if source_id.is_empty() {
        return Err("source_id is required".into());
    }
    if source_id.len() > MAX_SOURCE_ID_LEN {
        return Err("source_id exceeds 64 characters".into());
    }

    let event_type_raw = sanitize_capped(&envelope.event_type, MAX_EVENT_TYPE_LEN);
    if event_type_raw.is_empty() {
        return Err("event_type is required".into());
    }
    let event_type =
        EventType::parse(&event_type_raw).ok_or_else(|| "unrecognised event_type".to_string())?;

    if envelope.timestamp.trim().is_empty() {
        return Err("timestamp is required".into());
    }
    let timestamp = normalize_timestamp(envelope.timestamp.trim())
        .ok_or_else(|| "timestamp is not a valid ISO-8601 instant".to_string())?;

    let symbol = sanitize_capped(&envelope.payload.symbol, MAX_SYMBOL_LEN);
    if symbol.is_empty() {
        return Err("symbol is required".into());
    }

    let p = envelope.payload;
    let payload = OrderPayload {
        symbol,
        direction: sanitize_opt(p.direction, MAX_EVENT_TYPE_LEN),
        order_type: sanitize_opt(p.order_type, MAX_EVENT_TYPE_LEN),
        volume: sanitize_opt(p.volume, MAX_EVENT_TYPE_LEN),
        entry_price: sanitize_opt(p.entry_price, MAX_EVENT_TYPE_LEN),
        target_price: sanitize_opt(p.target_price, MAX_EVENT_TYPE_LEN),
        stop_loss: sanitize_opt(p.stop_loss, MAX_EVENT_TYPE_LEN),
        take_profit: sanitize_opt(p.take_profit, MAX_EVENT_TYPE_LEN),
        closing_price: sanitize_opt(p.closing_price, MAX_EVENT_TYPE_LEN),
        net_profit: sanitize_opt(p.net_profit, MAX_EVENT_TYPE_LEN),
        comment: sanitize_opt(p.comment, MAX_COMMENT_LEN),
    };

    Ok(NewOrderEvent {
        source_id,
        event_type,
        timestamp,
        payload,
    })
}

/// Broker configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
    pub database_path: String,
    /// Empty disables the shared-secret pre-filter.
    pub api_key: String,
    /// Retention window for done events.
    pub max_order_age: Duration,
    pub cleanup_interval: Duration,
    pub lease_duration: Duration,
    pub reaper_interval: Duration,
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_minute: u32,
    pub rate_limit_whitelist: Vec<String>,
    pub max_payload_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:5000".to_string(),
            database_path: "bridge.db".to_string(),
            api_key: String::new(),
            max_order_age: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(600),
            lease_duration: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(300),
            rate_limit_enabled: false,
            rate_limit_per_minute: 60,
            rate_limit_whitelist: Vec::new(),
            max_payload_depth: 32,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let rate_limit_whitelist = env::var("RATE_LIMIT_WHITELIST")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            listen_address: env::var("LISTEN_ADDRESS")
                .unwrap_or_else(|_| defaults.listen_address.clone()),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| defaults.database_path.clone()),
            api_key: env::var("API_KEY").unwrap_or_default(),
            max_order_age: env_duration_secs("MAX_ORDER_AGE_SECS", defaults.max_order_age),
            cleanup_interval: env_duration_secs("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
            lease_duration: env_duration_secs("LEASE_DURATION_SECS", defaults.lease_duration),
            reaper_interval: env_duration_secs("REAPER_INTERVAL_SECS", defaults.reaper_interval),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            initial_retry_delay: env_duration_secs(
                "INITIAL_RETRY_DELAY_SECS",
                defaults.initial_retry_delay,
            ),
            max_retry_delay: env_duration_secs("MAX_RETRY_DELAY_SECS", defaults.max_retry_delay),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", defaults.rate_limit_enabled),
            rate_limit_per_minute: env_parse(
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            ),
            rate_limit_whitelist,
            max_payload_depth: env_parse("MAX_PAYLOAD_DEPTH", defaults.max_payload_depth),
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

pub(crate) fn env_duration_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(source_id: &str, event_type: &str, symbol: &str) -> OrderEnvelope {
        OrderEnvelope {
            id: None,
            source_id: source_id.to_string(),
            event_type: event_type.to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            payload: OrderPayload {
                symbol: symbol.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(sanitize("EUR\u{0007}USD\n"), "EURUSD");
        assert_eq!(sanitize("plain text"), "plain text");
        assert_eq!(sanitize("\u{001b}[31mred\u{001b}[0m"), "[31mred[0m");
    }

    #[test]
    fn source_id_length_boundary() {
        let ok = envelope(&"a".repeat(64), "POSITION_OPENED", "EURUSD");
        assert!(validate_envelope(ok).is_ok());

        let too_long = envelope(&"a".repeat(65), "POSITION_OPENED", "EURUSD");
        let err = validate_envelope(too_long).unwrap_err();
        assert!(err.contains("source_id"));
    }

    #[test]
    fn comment_truncated_to_500() {
        let mut env = envelope("src-1", "POSITION_OPENED", "EURUSD");
        env.payload.comment = Some("c".repeat(501));
        let event = validate_envelope(env).unwrap();
        assert_eq!(event.payload.comment.unwrap().len(), 500);

        let mut env = envelope("src-2", "POSITION_OPENED", "EURUSD");
        env.payload.comment = Some("c".repeat(500));
        let event = validate_envelope(env).unwrap();
        assert_eq!(event.payload.comment.unwrap().len(), 500);
    }

    #[test]
    fn symbol_truncated_to_20() {
        let env = envelope("src-1", "POSITION_OPENED", &"S".repeat(30));
        let event = validate_envelope(env).unwrap();
        assert_eq!(event.payload.symbol.len(), 20);
    }

    #[test]
    fn unknown_event_type_rejected() {
        for raw in ["TRADE_OPENED", "position_opened", ""] {
            let env = envelope("src-1", raw, "EURUSD");
            assert!(validate_envelope(env).is_err(), "accepted {raw:?}");
        }
        let env = envelope("src-1", "PENDING_ORDER_FILLED", "EURUSD");
        assert_eq!(
            validate_envelope(env).unwrap().event_type,
            EventType::PendingOrderFilled
        );
    }

    #[test]
    fn timestamp_normalised_to_fixed_width() {
        let mut env = envelope("src-1", "POSITION_OPENED", "EURUSD");
        env.timestamp = "2025-06-01T12:30:45+02:00".to_string();
        let event = validate_envelope(env).unwrap();
        assert_eq!(event.timestamp, "2025-06-01T10:30:45.000Z");

        let mut env = envelope("src-2", "POSITION_OPENED", "EURUSD");
        env.timestamp = "not-a-time".to_string();
        assert!(validate_envelope(env).is_err());
    }

    #[test]
    fn json_depth_counts_nesting() {
        assert_eq!(json_depth(&json!("scalar")), 1);
        assert_eq!(json_depth(&json!({"a": 1})), 2);
        assert_eq!(json_depth(&json!({"a": {"b": [1, 2]}})), 4);

        let mut nested = json!(1);
        for _ in 0..32 {
            nested = json!({ "n": nested });
        }
        assert_eq!(json_depth(&nested), 33);
    }

    #[test]
    fn envelope_ignores_unknown_fields() {
        let raw = json!({
            "source_id": "abc",
            "event_type": "POSITION_OPENED",
            "timestamp": "2025-01-01T00:00:00Z",
            "symbol": "EURUSD",
            "completely_unknown": {"nested": true}
        });
        let env: OrderEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.source_id, "abc");
        assert!(validate_envelope(env).is_ok());
    }
}
