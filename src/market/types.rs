use crate::error::{AppError, SessionFatalKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_DISPLAY_FIAT: &str = "EUR";
pub const DEFAULT_FIAT_PRECISION: u32 = 2;
pub const DEFAULT_POLL_UNIT_MS: u64 = 1_000;
pub const MAX_FIAT_PRECISION: u32 = 8;
pub const MIN_POLL_UNIT_MS: u64 = 100;
pub const MAX_POLL_UNIT_MS: u64 = 60_000;
pub const TICKER_STREAM_SUFFIX: &str = "@ticker";

/// An ordered currency pair. `base` is priced in units of `quote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.trim().to_ascii_uppercase(),
            quote: quote.trim().to_ascii_uppercase(),
        }
    }

    pub fn stream_symbol(&self) -> String {
        format!("{}{}", self.base, self.quote).to_ascii_lowercase()
    }

    pub fn stream_tag(&self) -> String {
        format!("{}{TICKER_STREAM_SUFFIX}", self.stream_symbol())
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub symbol: String,
    pub display_name: String,
    pub balance: Option<Decimal>,
    pub precision: u32,
    pub is_pivot: bool,
}

/// Opaque group marker handed through to presentation untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionMarker(pub String);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetListing {
    pub symbol: String,
    #[serde(default)]
    pub display_name: String,
    pub precision: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetGroup {
    pub marker: SectionMarker,
    pub assets: Vec<AssetListing>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub pair: Pair,
    pub last_price: Decimal,
    pub percent_change_24h: Decimal,
    pub received_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub pair: Pair,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationState {
    pub pending: bool,
    pub attempts_remaining: u8,
}

/// Balances as returned by one successful refresh. Always applied whole.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BalanceReport {
    pub balances: HashMap<String, Decimal>,
    pub pivot_symbol: String,
    pub consent_redirect_url: Option<String>,
}

impl BalanceReport {
    pub fn consent_redirect(&self) -> Option<&str> {
        self.consent_redirect_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntryWire {
    pub symbol: String,
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceReportWire {
    #[serde(default)]
    pub balances: Vec<BalanceEntryWire>,
    pub pivot_symbol: String,
    #[serde(default)]
    pub consent_redirect_url: Option<String>,
}

impl TryFrom<BalanceReportWire> for BalanceReport {
    type Error = AppError;

    fn try_from(value: BalanceReportWire) -> Result<Self, Self::Error> {
        let pivot_symbol = value.pivot_symbol.trim().to_ascii_uppercase();
        if pivot_symbol.is_empty() {
            return Err(AppError::InvalidArgument(
                "balance report is missing the pivot symbol".to_string(),
            ));
        }

        let balances = value
            .balances
            .into_iter()
            .map(|entry| (entry.symbol.trim().to_ascii_uppercase(), entry.balance))
            .collect();

        Ok(Self {
            balances,
            pivot_symbol,
            consent_redirect_url: value.consent_redirect_url,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct TickerDataWire {
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    #[serde(rename = "c")]
    pub last_price: String,
    #[serde(rename = "P")]
    pub price_change_percent: String,
}

#[derive(Debug, Deserialize)]
pub struct TickerEnvelopeWire {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub data: Option<TickerDataWire>,
    #[serde(default)]
    pub id: Option<u64>,
}

/// A decoded ticker frame, not yet routed to a pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerEvent {
    pub stream: String,
    pub last_price: Decimal,
    pub percent_change_24h: Decimal,
    pub event_time_ms: Option<i64>,
}

impl TickerEvent {
    pub fn into_quote(self, pair: Pair, fallback_received_at_ms: i64) -> PriceQuote {
        PriceQuote {
            pair,
            last_price: self.last_price,
            percent_change_24h: self.percent_change_24h,
            received_at_ms: self.event_time_ms.unwrap_or(fallback_received_at_ms),
        }
    }
}

/// Returns `Ok(None)` for frames that are not ticker events (subscribe replies).
pub fn parse_ticker_payload(payload: &mut [u8]) -> Result<Option<TickerEvent>, AppError> {
    let wire: TickerEnvelopeWire = simd_json::serde::from_slice(payload)?;
    let (Some(stream), Some(data)) = (wire.stream, wire.data) else {
        if wire.id.is_some() {
            return Ok(None);
        }
        return Err(AppError::StreamDecode(
            "frame carries neither a stream tag nor a reply id".to_string(),
        ));
    };

    let last_price = Decimal::from_str(data.last_price.trim())?;
    let percent_change_24h = Decimal::from_str(data.price_change_percent.trim())?;
    if last_price.is_sign_negative() {
        return Err(AppError::StreamDecode(format!(
            "negative last price on stream '{stream}'"
        )));
    }

    Ok(Some(TickerEvent {
        stream,
        last_price,
        percent_change_24h,
        event_time_ms: data.event_time,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamMethod {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamCommand {
    pub method: StreamMethod,
    pub params: Vec<String>,
    pub id: u64,
}

impl StreamCommand {
    pub fn to_wire(&self) -> Result<String, AppError> {
        Ok(simd_json::serde::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Loading,
    AwaitingConsent,
    Running,
    Halted,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusSnapshot {
    pub state: SessionState,
    pub stream: StreamConnectionState,
    pub display_fiat: String,
    pub pivot: Option<String>,
    pub reconciliation: ReconciliationState,
    pub reason: Option<String>,
}

impl SessionStatusSnapshot {
    pub fn idle(display_fiat: String, reason: Option<String>) -> Self {
        Self {
            state: SessionState::Idle,
            stream: StreamConnectionState::Disconnected,
            display_fiat,
            pivot: None,
            reconciliation: ReconciliationState::default(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionArgs {
    pub display_fiat: Option<String>,
    pub fiat_precision: Option<u32>,
    pub poll_unit_ms: Option<u64>,
    pub visible_symbols: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub display_fiat: String,
    pub fiat_precision: u32,
    pub poll_unit_ms: u64,
    pub visible_symbols: Option<Vec<String>>,
}

pub fn normalize_symbol(raw: &str, field: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(format!(
            "{field} must be non-empty alphanumeric ASCII"
        )));
    }
    Ok(symbol)
}

impl StartSessionArgs {
    pub fn normalize(self) -> Result<SessionConfig, AppError> {
        let display_fiat = normalize_symbol(
            self.display_fiat
                .as_deref()
                .unwrap_or(DEFAULT_DISPLAY_FIAT),
            "displayFiat",
        )?;

        let fiat_precision = self.fiat_precision.unwrap_or(DEFAULT_FIAT_PRECISION);
        if fiat_precision > MAX_FIAT_PRECISION {
            return Err(AppError::InvalidArgument(format!(
                "fiatPrecision must be at most {MAX_FIAT_PRECISION}"
            )));
        }

        let poll_unit_ms = self.poll_unit_ms.unwrap_or(DEFAULT_POLL_UNIT_MS);
        if !(MIN_POLL_UNIT_MS..=MAX_POLL_UNIT_MS).contains(&poll_unit_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pollUnitMs must be between {MIN_POLL_UNIT_MS} and {MAX_POLL_UNIT_MS}"
            )));
        }

        let visible_symbols = self
            .visible_symbols
            .map(|symbols| {
                symbols
                    .iter()
                    .map(|symbol| normalize_symbol(symbol, "visibleSymbols"))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        Ok(SessionConfig {
            display_fiat,
            fiat_precision,
            poll_unit_ms,
            visible_symbols,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub running: bool,
    pub display_fiat: String,
    pub fiat_precision: u32,
    pub poll_unit_ms: u64,
}

impl SessionInfo {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            running: true,
            display_fiat: config.display_fiat.clone(),
            fiat_precision: config.fiat_precision,
            poll_unit_ms: config.poll_unit_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    pub symbol: String,
    pub display_name: String,
    pub balance: Option<Decimal>,
    pub precision: u32,
    pub is_pivot: bool,
    pub unit_price: Option<Decimal>,
    pub projected_fiat_value: Option<Decimal>,
    pub percent_change_24h: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SnapshotEntry {
    Section { marker: SectionMarker },
    Asset(AssetView),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub sequence: u64,
    pub display_fiat: String,
    pub pivot: String,
    pub entries: Vec<SnapshotEntry>,
    pub total_fiat_value: Decimal,
    pub stream: StreamConnectionState,
}

impl PortfolioSnapshot {
    pub fn assets(&self) -> impl Iterator<Item = &AssetView> {
        self.entries.iter().filter_map(|entry| match entry {
            SnapshotEntry::Asset(view) => Some(view),
            SnapshotEntry::Section { .. } => None,
        })
    }

    pub fn asset(&self, symbol: &str) -> Option<&AssetView> {
        self.assets().find(|view| view.symbol == symbol)
    }
}

/// Everything the engine publishes to the presentation layer.
#[derive(Debug, Clone)]
pub enum EngineUpdate {
    Snapshot(Arc<PortfolioSnapshot>),
    ServiceError(String),
    ConsentRequired(String),
    StreamState(StreamConnectionState),
    SessionHalted(SessionFatalKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pair_builds_lowercase_stream_tag() {
        let pair = Pair::new("btc", "usdt");
        assert_eq!(pair.base, "BTC");
        assert_eq!(pair.stream_symbol(), "btcusdt");
        assert_eq!(pair.stream_tag(), "btcusdt@ticker");
    }

    #[test]
    fn parses_valid_ticker_payload() {
        let mut payload = br#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1700000000123,"s":"BTCUSDT","p":"120.5","P":"-1.25","c":"60000.10"}}"#
            .to_vec();
        let event = parse_ticker_payload(&mut payload)
            .expect("ticker payload should parse")
            .expect("ticker payload should carry an event");

        assert_eq!(event.stream, "btcusdt@ticker");
        assert_eq!(event.last_price, dec!(60000.10));
        assert_eq!(event.percent_change_24h, dec!(-1.25));
        assert_eq!(event.event_time_ms, Some(1_700_000_000_123));
    }

    #[test]
    fn subscribe_replies_are_not_events() {
        let mut payload = br#"{"result":null,"id":3}"#.to_vec();
        let parsed = parse_ticker_payload(&mut payload).expect("reply should decode");
        assert!(parsed.is_none());
    }

    #[test]
    fn rejects_malformed_ticker_payload() {
        let mut broken_price =
            br#"{"stream":"btcusdt@ticker","data":{"E":1,"c":"broken","P":"0.1"}}"#.to_vec();
        assert!(parse_ticker_payload(&mut broken_price).is_err());

        let mut untagged = br#"{"data":{"E":1,"c":"1.0","P":"0.1"}}"#.to_vec();
        assert!(matches!(
            parse_ticker_payload(&mut untagged),
            Err(AppError::StreamDecode(_))
        ));

        let mut not_json = b"not json at all".to_vec();
        assert!(parse_ticker_payload(&mut not_json).is_err());
    }

    #[test]
    fn stream_command_serializes_to_wire_shape() {
        let command = StreamCommand {
            method: StreamMethod::Unsubscribe,
            params: vec!["btcusdt@ticker".to_string()],
            id: 7,
        };
        let wire = command.to_wire().expect("command should serialize");
        assert_eq!(
            wire,
            r#"{"method":"UNSUBSCRIBE","params":["btcusdt@ticker"],"id":7}"#
        );
    }

    #[test]
    fn ticker_falls_back_to_local_receive_time() {
        let event = TickerEvent {
            stream: "ethusdt@ticker".to_string(),
            last_price: dec!(3000),
            percent_change_24h: dec!(2),
            event_time_ms: None,
        };
        let quote = event.into_quote(Pair::new("ETH", "USDT"), 42);
        assert_eq!(quote.received_at_ms, 42);
    }

    #[test]
    fn blank_consent_redirect_is_ignored() {
        let report = BalanceReport {
            consent_redirect_url: Some("   ".to_string()),
            ..BalanceReport::default()
        };
        assert_eq!(report.consent_redirect(), None);
    }

    #[test]
    fn converts_balance_wire_with_uppercase_symbols() {
        let wire = BalanceReportWire {
            balances: vec![BalanceEntryWire {
                symbol: "btc".to_string(),
                balance: dec!(0.5),
            }],
            pivot_symbol: "usdt".to_string(),
            consent_redirect_url: None,
        };
        let report = BalanceReport::try_from(wire).expect("wire should convert");
        assert_eq!(report.pivot_symbol, "USDT");
        assert_eq!(report.balances.get("BTC"), Some(&dec!(0.5)));
    }

    #[test]
    fn normalizes_start_args_defaults() {
        let config = StartSessionArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.display_fiat, DEFAULT_DISPLAY_FIAT);
        assert_eq!(config.fiat_precision, DEFAULT_FIAT_PRECISION);
        assert_eq!(config.poll_unit_ms, DEFAULT_POLL_UNIT_MS);
        assert!(config.visible_symbols.is_none());
    }

    #[test]
    fn validates_poll_unit_range() {
        let result = StartSessionArgs {
            poll_unit_ms: Some(5),
            ..StartSessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_fiat_and_visible_symbols() {
        let bad_fiat = StartSessionArgs {
            display_fiat: Some("E-UR".to_string()),
            ..StartSessionArgs::default()
        }
        .normalize();
        assert!(bad_fiat.is_err());

        let config = StartSessionArgs {
            visible_symbols: Some(vec![" btc".to_string(), "eth".to_string()]),
            ..StartSessionArgs::default()
        }
        .normalize()
        .expect("symbols should normalize");
        assert_eq!(
            config.visible_symbols,
            Some(vec!["BTC".to_string(), "ETH".to_string()])
        );
    }
}
