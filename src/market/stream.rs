use crate::error::AppError;
use crate::market::price_cache::{PriceCache, QuoteApplyOutcome};
use crate::market::subscriptions::SubscriptionManager;
use crate::market::types::{
    parse_ticker_payload, Pair, StreamCommand, StreamConnectionState, TickerEvent,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async_with_config;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_STREAM_URL: &str = "wss://stream.binance.com:9443/stream";
const STREAM_URL_ENV: &str = "WALLET_SYNC_STREAM_URL";

pub fn resolve_stream_url() -> String {
    std::env::var(STREAM_URL_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    Text(String),
    Closed(Option<String>),
}

/// Channel pair bridging one live feed socket. Dropping `outbound` closes it.
pub struct FeedLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<FeedFrame>,
}

#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self, cancel: CancellationToken) -> Result<FeedLink, AppError>;
}

pub struct WebSocketFeedConnector {
    url: String,
}

impl WebSocketFeedConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedConnector for WebSocketFeedConnector {
    async fn connect(&self, cancel: CancellationToken) -> Result<FeedLink, AppError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };
        let (socket, _) = connect_async_with_config(self.url.as_str(), Some(ws_config), true).await?;
        let (mut sink, mut source) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<FeedFrame>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    outgoing = outbound_rx.recv() => {
                        let Some(text) = outgoing else {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        };
                        if let Err(error) = sink.send(Message::Text(text)).await {
                            let _ = inbound_tx.send(FeedFrame::Closed(Some(error.to_string())));
                            break;
                        }
                    }
                    incoming = source.next() => {
                        let frame = match incoming {
                            Some(Ok(Message::Text(text))) => FeedFrame::Text(text),
                            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                Ok(text) => FeedFrame::Text(text),
                                Err(_) => continue,
                            },
                            Some(Ok(Message::Close(close))) => {
                                let _ = inbound_tx.send(FeedFrame::Closed(
                                    close.map(|frame| frame.reason.to_string()),
                                ));
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(error)) => {
                                let _ = inbound_tx.send(FeedFrame::Closed(Some(error.to_string())));
                                break;
                            }
                            None => {
                                let _ = inbound_tx.send(FeedFrame::Closed(None));
                                break;
                            }
                        };
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(FeedLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Signals from a connection task, tagged with the generation that produced
/// them so a superseded socket cannot touch engine state.
#[derive(Debug)]
pub enum StreamSignal {
    Connected {
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
    },
    Frame {
        generation: u64,
        payload: String,
    },
    Disconnected {
        generation: u64,
        reason: Option<String>,
    },
}

/// Engine-side view of the ticker feed: `Disconnected -> Connecting ->
/// Connected -> Disconnected`. It never reconnects on its own.
#[derive(Debug)]
pub struct StreamConnection {
    state: StreamConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    cancel: Option<CancellationToken>,
}

impl Default for StreamConnection {
    fn default() -> Self {
        Self {
            state: StreamConnectionState::Disconnected,
            generation: 0,
            outbound: None,
            cancel: None,
        }
    }
}

impl StreamConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == StreamConnectionState::Connected
    }

    /// Starts a connection attempt. Returns false unless currently disconnected.
    pub fn open(
        &mut self,
        connector: Arc<dyn FeedConnector>,
        signals: mpsc::UnboundedSender<StreamSignal>,
        parent: &CancellationToken,
    ) -> bool {
        if self.state != StreamConnectionState::Disconnected {
            return false;
        }

        self.generation = self.generation.saturating_add(1);
        self.state = StreamConnectionState::Connecting;
        let generation = self.generation;
        let token = parent.child_token();
        self.cancel = Some(token.clone());

        tokio::spawn(async move {
            let connected = tokio::select! {
                _ = token.cancelled() => return,
                result = connector.connect(token.clone()) => result,
            };

            let FeedLink {
                outbound,
                mut inbound,
            } = match connected {
                Ok(link) => link,
                Err(error) => {
                    let _ = signals.send(StreamSignal::Disconnected {
                        generation,
                        reason: Some(error.to_string()),
                    });
                    return;
                }
            };

            if signals
                .send(StreamSignal::Connected {
                    generation,
                    outbound,
                })
                .is_err()
            {
                return;
            }

            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = inbound.recv() => frame,
                };
                let signal = match frame {
                    Some(FeedFrame::Text(payload)) => StreamSignal::Frame {
                        generation,
                        payload,
                    },
                    Some(FeedFrame::Closed(reason)) => StreamSignal::Disconnected {
                        generation,
                        reason,
                    },
                    None => StreamSignal::Disconnected {
                        generation,
                        reason: None,
                    },
                };
                let finished = matches!(signal, StreamSignal::Disconnected { .. });
                if signals.send(signal).is_err() || finished {
                    break;
                }
            }
        });

        true
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state != StreamConnectionState::Disconnected
    }

    pub fn on_connected(
        &mut self,
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
    ) -> bool {
        if generation != self.generation || self.state != StreamConnectionState::Connecting {
            return false;
        }
        self.state = StreamConnectionState::Connected;
        self.outbound = Some(outbound);
        info!(generation, "ticker feed connected");
        true
    }

    pub fn on_disconnected(&mut self, generation: u64, reason: Option<&str>) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.state = StreamConnectionState::Disconnected;
        self.outbound = None;
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        warn!(generation, reason = reason.unwrap_or("closed"), "ticker feed disconnected");
        true
    }

    /// Fire-and-forget. The feed never acknowledges, so a lost command only
    /// shows up as missing ticks.
    pub fn send(&self, command: &StreamCommand) {
        let Some(outbound) = self.outbound.as_ref() else {
            debug!(id = command.id, "ticker feed not connected, command dropped");
            return;
        };
        match command.to_wire() {
            Ok(wire) => {
                if outbound.send(wire).is_err() {
                    debug!(id = command.id, "ticker feed writer gone, command dropped");
                }
            }
            Err(error) => debug!(id = command.id, error = %error, "failed to encode command"),
        }
    }

    pub fn close(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.outbound = None;
        self.state = StreamConnectionState::Disconnected;
        self.generation = self.generation.saturating_add(1);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Applied(Pair),
    Stale(Pair),
    Unrouted(String),
    Reply,
    Malformed,
}

impl FrameOutcome {
    pub fn changed_cache(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Decodes one inbound frame and hands it to the cache if its stream tag
/// belongs to the current subscription set. Nothing here is an error.
pub fn route_frame(
    payload: &str,
    subscriptions: &SubscriptionManager,
    cache: &mut PriceCache,
    now_ms: i64,
) -> FrameOutcome {
    let mut owned_payload = payload.as_bytes().to_vec();
    let event: TickerEvent = match parse_ticker_payload(owned_payload.as_mut_slice()) {
        Ok(Some(event)) => event,
        Ok(None) => return FrameOutcome::Reply,
        Err(error) => {
            debug!(error = %error, "dropping undecodable ticker frame");
            return FrameOutcome::Malformed;
        }
    };

    let Some(pair) = subscriptions.route(&event.stream).cloned() else {
        debug!(stream = %event.stream, "dropping unrouted ticker frame");
        return FrameOutcome::Unrouted(event.stream);
    };

    match cache.apply(event.into_quote(pair.clone(), now_ms)) {
        QuoteApplyOutcome::Inserted | QuoteApplyOutcome::Updated => FrameOutcome::Applied(pair),
        QuoteApplyOutcome::Stale { .. } => FrameOutcome::Stale(pair),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::subscriptions::desired_set;
    use crate::market::types::{Asset, StreamMethod};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct ChannelConnector {
        link: parking_lot::Mutex<Option<FeedLink>>,
    }

    #[async_trait]
    impl FeedConnector for ChannelConnector {
        async fn connect(&self, _cancel: CancellationToken) -> Result<FeedLink, AppError> {
            self.link
                .lock()
                .take()
                .ok_or_else(|| AppError::InvalidArgument("link already used".to_string()))
        }
    }

    fn btc_manager() -> SubscriptionManager {
        let mut manager = SubscriptionManager::new();
        let btc = Asset {
            symbol: "BTC".to_string(),
            display_name: "Bitcoin".to_string(),
            balance: None,
            precision: 8,
            is_pivot: false,
        };
        manager.replace(desired_set(&[btc], "USDT", "EUR"), true);
        manager
    }

    #[test]
    fn stream_url_defaults_to_combined_endpoint() {
        assert!(DEFAULT_STREAM_URL.ends_with("/stream"));
    }

    #[test]
    fn routes_known_stream_tags_into_cache() {
        let manager = btc_manager();
        let mut cache = PriceCache::new("USDT", "EUR");

        let outcome = route_frame(
            r#"{"stream":"btcusdt@ticker","data":{"E":100,"c":"60000","P":"1.0"}}"#,
            &manager,
            &mut cache,
            0,
        );
        assert_eq!(outcome, FrameOutcome::Applied(Pair::new("BTC", "USDT")));
        assert_eq!(cache.rate_to_pivot("BTC"), Some(dec!(60000)));

        let stale = route_frame(
            r#"{"stream":"btcusdt@ticker","data":{"E":99,"c":"1","P":"1.0"}}"#,
            &manager,
            &mut cache,
            0,
        );
        assert_eq!(stale, FrameOutcome::Stale(Pair::new("BTC", "USDT")));
        assert_eq!(cache.rate_to_pivot("BTC"), Some(dec!(60000)));
    }

    #[test]
    fn unknown_and_malformed_frames_leave_cache_untouched() {
        let manager = btc_manager();
        let mut cache = PriceCache::new("USDT", "EUR");

        let unrouted = route_frame(
            r#"{"stream":"dogeusdt@ticker","data":{"E":1,"c":"0.1","P":"1.0"}}"#,
            &manager,
            &mut cache,
            0,
        );
        assert_eq!(unrouted, FrameOutcome::Unrouted("dogeusdt@ticker".to_string()));
        assert_eq!(route_frame("{oops", &manager, &mut cache, 0), FrameOutcome::Malformed);
        assert_eq!(
            route_frame(r#"{"result":null,"id":1}"#, &manager, &mut cache, 0),
            FrameOutcome::Reply
        );
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn connection_walks_through_states_and_ignores_superseded_signals() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(ChannelConnector {
            link: parking_lot::Mutex::new(Some(FeedLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })),
        });
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let mut connection = StreamConnection::new();

        assert!(connection.open(connector.clone(), signals_tx.clone(), &root));
        assert_eq!(connection.state(), StreamConnectionState::Connecting);
        assert!(!connection.open(connector, signals_tx, &root));

        let signal = tokio::time::timeout(Duration::from_secs(1), signals_rx.recv())
            .await
            .expect("connect signal")
            .expect("signal channel open");
        let StreamSignal::Connected {
            generation,
            outbound,
        } = signal
        else {
            panic!("expected connected signal");
        };
        assert!(connection.on_connected(generation, outbound));
        assert!(connection.is_connected());

        connection.send(&StreamCommand {
            method: StreamMethod::Subscribe,
            params: vec!["btcusdt@ticker".to_string()],
            id: 1,
        });
        let sent = outbound_rx.recv().await.expect("command forwarded");
        assert!(sent.contains(r#""method":"SUBSCRIBE""#));

        inbound_tx
            .send(FeedFrame::Text("hello".to_string()))
            .expect("frame accepted");
        match signals_rx.recv().await {
            Some(StreamSignal::Frame { payload, .. }) => assert_eq!(payload, "hello"),
            other => panic!("unexpected signal: {other:?}"),
        }

        inbound_tx
            .send(FeedFrame::Closed(Some("bye".to_string())))
            .expect("close accepted");
        match signals_rx.recv().await {
            Some(StreamSignal::Disconnected { generation: current, reason }) => {
                assert_eq!(reason.as_deref(), Some("bye"));
                assert!(connection.on_disconnected(current, reason.as_deref()));
            }
            other => panic!("unexpected signal: {other:?}"),
        }
        assert_eq!(connection.state(), StreamConnectionState::Disconnected);
        assert!(!connection.on_disconnected(generation, None));
    }
}
