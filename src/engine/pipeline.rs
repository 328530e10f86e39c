use crate::engine::projector::ViewProjector;
use crate::error::AppError;
use crate::market::price_cache::PriceCache;
use crate::market::stream::{route_frame, FeedConnector, StreamConnection, StreamSignal};
use crate::market::subscriptions::{desired_set, SubscriptionManager};
use crate::market::types::{
    AssetGroup, BalanceReport, EngineUpdate, SessionConfig, SessionState, SessionStatusSnapshot,
    StreamConnectionState,
};
use crate::wallet::catalog::{AssetCatalog, AssetCatalogSource};
use crate::wallet::poller::BalancePoller;
use crate::wallet::reconcile::ReconciliationController;
use crate::wallet::service::{BalanceService, ConnectivityProbe};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NOTICE_THROTTLE_MS: u64 = 500;

/// External collaborators the engine calls into.
#[derive(Clone)]
pub struct EngineDeps {
    pub balance_service: Arc<dyn BalanceService>,
    pub catalog_source: Arc<dyn AssetCatalogSource>,
    pub feed: Arc<dyn FeedConnector>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    ReenterView,
    SetVisibleAssets(Option<Vec<String>>),
    TradeSubmitted,
    ConsentResolved,
}

/// Results marshalled back onto the engine queue from spawned requests.
#[derive(Debug)]
enum EngineEvent {
    Loaded(Result<(Vec<AssetGroup>, BalanceReport), AppError>),
    BalanceRefreshed(Result<BalanceReport, AppError>),
}

#[derive(Debug, Default)]
struct NoticeThrottle {
    last_message: Option<String>,
    last_emit: Option<Instant>,
}

impl NoticeThrottle {
    fn allow(&mut self, message: &str, now: Instant) -> bool {
        let repeated = self.last_message.as_deref() == Some(message)
            && self
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(NOTICE_THROTTLE_MS)
                })
                .unwrap_or(false);
        if repeated {
            return false;
        }
        self.last_message = Some(message.to_string());
        self.last_emit = Some(now);
        true
    }
}

struct Engine {
    config: SessionConfig,
    deps: EngineDeps,
    updates: broadcast::Sender<EngineUpdate>,
    status_store: Arc<RwLock<SessionStatusSnapshot>>,
    cancel_token: CancellationToken,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    signals_tx: mpsc::UnboundedSender<StreamSignal>,
    state: SessionState,
    load_in_flight: bool,
    visible_selection: Option<Vec<String>>,
    catalog: Option<AssetCatalog>,
    cache: PriceCache,
    subscriptions: SubscriptionManager,
    stream: StreamConnection,
    poller: BalancePoller,
    reconciliation: ReconciliationController,
    projector: ViewProjector,
    notice_throttle: NoticeThrottle,
}

/// Runs one view's engine until cancelled, the command channel closes, or a
/// session-fatal condition arrives. All state lives on this task.
pub async fn run_engine(
    config: SessionConfig,
    deps: EngineDeps,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    updates: broadcast::Sender<EngineUpdate>,
    status_store: Arc<RwLock<SessionStatusSnapshot>>,
    cancel_token: CancellationToken,
) -> Result<(), AppError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();

    let mut engine = Engine {
        cache: PriceCache::new("", &config.display_fiat),
        poller: BalancePoller::new(Duration::from_millis(config.poll_unit_ms)),
        projector: ViewProjector::new(config.fiat_precision),
        visible_selection: config.visible_symbols.clone(),
        config,
        deps,
        updates,
        status_store,
        cancel_token: cancel_token.clone(),
        events_tx,
        signals_tx,
        state: SessionState::Idle,
        load_in_flight: false,
        catalog: None,
        subscriptions: SubscriptionManager::new(),
        stream: StreamConnection::new(),
        reconciliation: ReconciliationController::new(),
        notice_throttle: NoticeThrottle::default(),
    };

    engine.begin_load().await;

    let outcome = loop {
        let deadline = engine.poller.deadline();
        let step = tokio::select! {
            _ = cancel_token.cancelled() => break Ok(()),
            command = commands.recv() => match command {
                Some(command) => engine.handle_command(command).await,
                None => break Ok(()),
            },
            Some(event) = events_rx.recv() => engine.handle_event(event).await,
            Some(signal) = signals_rx.recv() => {
                engine.handle_signal(signal).await;
                Ok(())
            }
            _ = sleep_until_deadline(deadline) => {
                engine.handle_poll_tick();
                Ok(())
            }
        };
        if let Err(error) = step {
            break Err(error);
        }
    };

    engine.teardown(&outcome).await;
    outcome
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl Engine {
    /// The load stands in for the burst's first fire; failed loads are retried
    /// on later poller fires.
    async fn begin_load(&mut self) {
        self.state = SessionState::Loading;
        if !self.poller.is_running() {
            let now = Instant::now();
            self.poller.start(now);
            self.poller.on_tick(now);
        }
        self.spawn_load();
        self.publish_status(Some("loading assets and balances".to_string()))
            .await;
    }

    fn spawn_load(&mut self) {
        self.load_in_flight = true;
        let catalog_source = Arc::clone(&self.deps.catalog_source);
        let balance_service = Arc::clone(&self.deps.balance_service);
        let currency = self.config.display_fiat.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let (groups, report) = tokio::join!(
                catalog_source.fetch_groups(),
                balance_service.refresh(&currency)
            );
            let loaded = match (groups, report) {
                (Ok(groups), Ok(report)) => Ok((groups, report)),
                (Err(error), _) | (_, Err(error)) => Err(error),
            };
            let _ = events_tx.send(EngineEvent::Loaded(loaded));
        });
    }

    async fn handle_command(&mut self, command: EngineCommand) -> Result<(), AppError> {
        debug!(?command, state = ?self.state, "engine command");
        match command {
            EngineCommand::ReenterView => match self.state {
                SessionState::Running => {
                    if !self.open_stream() {
                        self.replace_subscriptions();
                    }
                    self.publish_snapshot();
                }
                SessionState::Loading if !self.load_in_flight => self.spawn_load(),
                _ => {}
            },
            EngineCommand::SetVisibleAssets(symbols) => {
                self.visible_selection = symbols.clone();
                let changed = self
                    .catalog
                    .as_mut()
                    .map(|catalog| catalog.set_visible(symbols))
                    .unwrap_or(false);
                if changed && self.state == SessionState::Running {
                    self.replace_subscriptions();
                    self.publish_snapshot();
                }
            }
            EngineCommand::TradeSubmitted => {
                self.reconciliation.on_trade_submitted();
                self.publish_status(Some("trade submitted, reconciling balances".to_string()))
                    .await;
            }
            EngineCommand::ConsentResolved => {
                if self.state == SessionState::AwaitingConsent {
                    self.begin_load().await;
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Result<(), AppError> {
        match event {
            EngineEvent::Loaded(Ok((groups, report))) => {
                self.load_in_flight = false;
                if self.state != SessionState::Loading {
                    return Ok(());
                }
                if let Some(url) = report.consent_redirect() {
                    self.await_consent(url.to_string()).await;
                    return Ok(());
                }
                self.activate(groups, report).await;
                Ok(())
            }
            EngineEvent::Loaded(Err(error)) => {
                self.load_in_flight = false;
                if error.fatal_kind().is_some() {
                    return Err(error);
                }
                if matches!(error, AppError::Connectivity) {
                    debug!("initial load skipped, network unavailable");
                } else {
                    warn!(error = %error, "initial load failed, retrying on next poll");
                    self.notify_service_error(&error);
                }
                if self.state == SessionState::Loading {
                    self.publish_status(Some("initial load failed, retrying".to_string()))
                        .await;
                }
                Ok(())
            }
            EngineEvent::BalanceRefreshed(result) => self.apply_refresh(result).await,
        }
    }

    async fn activate(&mut self, groups: Vec<AssetGroup>, report: BalanceReport) {
        let mut catalog = AssetCatalog::build(groups, &report);
        catalog.set_visible(self.visible_selection.clone());
        info!(
            pivot = %report.pivot_symbol,
            fiat = %self.config.display_fiat,
            assets = catalog.assets().count(),
            "wallet view active"
        );

        self.cache = PriceCache::new(&report.pivot_symbol, &self.config.display_fiat);
        self.catalog = Some(catalog);
        self.state = SessionState::Running;
        self.replace_subscriptions();
        self.open_stream();
        self.publish_status(Some("polling balances".to_string()))
            .await;
        self.publish_snapshot();
    }

    async fn await_consent(&mut self, url: String) {
        info!("consent redirect pending, polling and stream held back");
        self.poller.stop();
        self.stream.close();
        self.subscriptions.clear();
        self.cache.clear();
        self.state = SessionState::AwaitingConsent;
        let _ = self.updates.send(EngineUpdate::ConsentRequired(url));
        self.publish_status(Some("waiting for consent redirect".to_string()))
            .await;
    }

    async fn apply_refresh(
        &mut self,
        result: Result<BalanceReport, AppError>,
    ) -> Result<(), AppError> {
        if let Some(kind) = result.as_ref().err().and_then(AppError::fatal_kind) {
            return Err(AppError::SessionFatal(kind));
        }
        if self.state != SessionState::Running {
            debug!(state = ?self.state, "ignoring balance response outside running state");
            return Ok(());
        }

        let report = match result {
            Ok(report) => report,
            Err(AppError::Connectivity) => {
                debug!("balance refresh skipped, network unavailable");
                return Ok(());
            }
            Err(error) => {
                warn!(error = %error, "balance refresh failed");
                self.notify_service_error(&error);
                return Ok(());
            }
        };

        if let Some(url) = report.consent_redirect() {
            self.await_consent(url.to_string()).await;
            return Ok(());
        }

        let pivot_changed = self
            .catalog
            .as_mut()
            .map(|catalog| {
                catalog.apply_balances(&report.balances);
                catalog.set_pivot(&report.pivot_symbol)
            })
            .unwrap_or(false);
        if pivot_changed {
            info!(pivot = %report.pivot_symbol, "pivot changed, resubscribing");
            self.cache.set_pivot(&report.pivot_symbol);
            self.replace_subscriptions();
        }

        if self.reconciliation.on_refresh_completed() {
            self.spawn_refresh();
        }
        self.publish_status(None).await;
        self.publish_snapshot();
        Ok(())
    }

    async fn handle_signal(&mut self, signal: StreamSignal) {
        match signal {
            StreamSignal::Connected {
                generation,
                outbound,
            } => {
                if !self.stream.on_connected(generation, outbound) {
                    return;
                }
                for command in self.subscriptions.on_connected() {
                    self.stream.send(&command);
                }
                self.on_stream_state_changed().await;
            }
            StreamSignal::Frame {
                generation,
                payload,
            } => {
                if !self.stream.is_current(generation) {
                    return;
                }
                let outcome =
                    route_frame(&payload, &self.subscriptions, &mut self.cache, now_unix_ms());
                if outcome.changed_cache() {
                    self.publish_snapshot();
                }
            }
            StreamSignal::Disconnected { generation, reason } => {
                if !self.stream.on_disconnected(generation, reason.as_deref()) {
                    return;
                }
                self.subscriptions.on_disconnected();
                self.on_stream_state_changed().await;
            }
        }
    }

    fn handle_poll_tick(&mut self) {
        let Some(tick) = self.poller.on_tick(Instant::now()) else {
            return;
        };
        if !tick.fire {
            return;
        }
        if !self.deps.connectivity.is_online() {
            debug!(phase = ?tick.phase, "offline, skipping balance refresh");
            return;
        }
        match self.state {
            SessionState::Running => self.spawn_refresh(),
            SessionState::Loading if !self.load_in_flight => self.spawn_load(),
            _ => {}
        }
    }

    /// Overlapping requests are not ordered; whichever response lands last wins.
    fn spawn_refresh(&self) {
        let balance_service = Arc::clone(&self.deps.balance_service);
        let currency = self.config.display_fiat.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = balance_service.refresh(&currency).await;
            let _ = events_tx.send(EngineEvent::BalanceRefreshed(result));
        });
    }

    fn open_stream(&mut self) -> bool {
        self.stream.open(
            Arc::clone(&self.deps.feed),
            self.signals_tx.clone(),
            &self.cancel_token,
        )
    }

    fn replace_subscriptions(&mut self) {
        let Some(catalog) = self.catalog.as_ref() else {
            return;
        };
        let desired = desired_set(
            &catalog.visible_assets(),
            catalog.pivot(),
            &self.config.display_fiat,
        );
        let commands = self.subscriptions.replace(desired, self.stream.is_connected());
        for command in &commands {
            self.stream.send(command);
        }
        let subscriptions = &self.subscriptions;
        self.cache.retain_pairs(|pair| subscriptions.contains(pair));
    }

    async fn on_stream_state_changed(&mut self) {
        let _ = self
            .updates
            .send(EngineUpdate::StreamState(self.stream.state()));
        self.publish_status(None).await;
        self.publish_snapshot();
    }

    fn notify_service_error(&mut self, error: &AppError) {
        let message = error.to_string();
        if self.notice_throttle.allow(&message, Instant::now()) {
            let _ = self.updates.send(EngineUpdate::ServiceError(message));
        }
    }

    fn publish_snapshot(&mut self) {
        let Some(catalog) = self.catalog.as_ref() else {
            return;
        };
        let snapshot = self
            .projector
            .recompute(catalog, &self.cache, self.stream.state());
        let _ = self.updates.send(EngineUpdate::Snapshot(Arc::new(snapshot)));
    }

    async fn publish_status(&self, reason: Option<String>) {
        let mut writable = self.status_store.write().await;
        let reason = reason.or_else(|| writable.reason.clone());
        *writable = SessionStatusSnapshot {
            state: self.state,
            stream: self.stream.state(),
            display_fiat: self.config.display_fiat.clone(),
            pivot: self.catalog.as_ref().map(|catalog| catalog.pivot().to_string()),
            reconciliation: self.reconciliation.state(),
            reason,
        };
    }

    async fn teardown(&mut self, outcome: &Result<(), AppError>) {
        self.poller.stop();
        self.stream.close();
        self.subscriptions.clear();
        self.cache.clear();
        self.reconciliation.reset();

        let reason = match outcome.as_ref().err().and_then(AppError::fatal_kind) {
            Some(kind) => {
                warn!(reason = kind.as_str(), "session halted");
                self.state = SessionState::Halted;
                let _ = self.updates.send(EngineUpdate::SessionHalted(kind));
                kind.as_str().to_string()
            }
            None => {
                self.state = SessionState::Stopped;
                "view closed".to_string()
            }
        };
        let _ = self
            .updates
            .send(EngineUpdate::StreamState(StreamConnectionState::Disconnected));
        self.publish_status(Some(reason)).await;
    }
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
