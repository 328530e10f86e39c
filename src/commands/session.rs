use crate::engine::pipeline::{run_engine, EngineCommand};
use crate::error::AppError;
use crate::market::types::{
    normalize_symbol, EngineUpdate, SessionInfo, SessionState, SessionStatusSnapshot,
    SessionStopResult, StartSessionArgs, StreamConnectionState,
};
use crate::state::{SessionHandle, WalletSyncState};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Starts the engine for a freshly entered view, replacing any running one.
pub async fn start_session(
    state: &WalletSyncState,
    args: Option<StartSessionArgs>,
) -> Result<SessionInfo, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut session_slot = state.session.lock().await;
        session_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let cancellation_token = CancellationToken::new();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let join_handle = tokio::spawn(run_engine(
        config.clone(),
        state.deps.clone(),
        commands_rx,
        state.updates.clone(),
        Arc::clone(&state.status),
        cancellation_token.clone(),
    ));

    {
        let mut session_slot = state.session.lock().await;
        *session_slot = Some(SessionHandle {
            cancellation_token,
            join_handle,
            commands,
        });
    }

    info!(fiat = %config.display_fiat, "wallet session started");
    Ok(SessionInfo::from_config(&config))
}

/// Leaves the view: cancels the engine and waits for its teardown.
pub async fn stop_session(state: &WalletSyncState) -> Result<SessionStopResult, AppError> {
    let existing_handle = {
        let mut session_slot = state.session.lock().await;
        session_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    {
        let mut writable = state.status.write().await;
        if writable.state != SessionState::Halted {
            let display_fiat = writable.display_fiat.clone();
            *writable = SessionStatusSnapshot {
                state: SessionState::Stopped,
                stream: StreamConnectionState::Disconnected,
                display_fiat,
                pivot: None,
                reconciliation: Default::default(),
                reason: Some("session stopped by command".to_string()),
            };
        }
    }

    Ok(SessionStopResult { stopped })
}

pub async fn session_status(state: &WalletSyncState) -> Result<SessionStatusSnapshot, AppError> {
    let snapshot = state.status.read().await.clone();
    Ok(snapshot)
}

pub fn subscribe_updates(state: &WalletSyncState) -> broadcast::Receiver<EngineUpdate> {
    state.updates.subscribe()
}

pub async fn reenter_view(state: &WalletSyncState) -> Result<(), AppError> {
    send_command(state, EngineCommand::ReenterView).await
}

pub async fn set_visible_assets(
    state: &WalletSyncState,
    symbols: Option<Vec<String>>,
) -> Result<(), AppError> {
    let symbols = symbols
        .map(|symbols| {
            symbols
                .iter()
                .map(|symbol| normalize_symbol(symbol, "symbols"))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;
    send_command(state, EngineCommand::SetVisibleAssets(symbols)).await
}

pub async fn notify_trade_submitted(state: &WalletSyncState) -> Result<(), AppError> {
    send_command(state, EngineCommand::TradeSubmitted).await
}

pub async fn resolve_consent(state: &WalletSyncState) -> Result<(), AppError> {
    send_command(state, EngineCommand::ConsentResolved).await
}

async fn send_command(state: &WalletSyncState, command: EngineCommand) -> Result<(), AppError> {
    let session_slot = state.session.lock().await;
    let handle = session_slot.as_ref().ok_or(AppError::SessionNotRunning)?;
    handle
        .commands
        .send(command)
        .map_err(|_| AppError::SessionNotRunning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pipeline::EngineDeps;
    use crate::market::stream::{FeedConnector, FeedLink};
    use crate::market::types::{AssetGroup, AssetListing, BalanceReport, SectionMarker};
    use crate::wallet::catalog::AssetCatalogSource;
    use crate::wallet::service::{BalanceService, ConnectivityFlag};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::time::Duration;

    struct StaticBalances;

    #[async_trait]
    impl BalanceService for StaticBalances {
        async fn refresh(&self, _currency: &str) -> Result<BalanceReport, AppError> {
            Ok(BalanceReport {
                balances: HashMap::from([("USDT".to_string(), dec!(10))]),
                pivot_symbol: "USDT".to_string(),
                consent_redirect_url: None,
            })
        }
    }

    struct StaticCatalog;

    #[async_trait]
    impl AssetCatalogSource for StaticCatalog {
        async fn fetch_groups(&self) -> Result<Vec<AssetGroup>, AppError> {
            Ok(vec![AssetGroup {
                marker: SectionMarker("owned".to_string()),
                assets: vec![AssetListing {
                    symbol: "USDT".to_string(),
                    display_name: "Tether".to_string(),
                    precision: 2,
                }],
            }])
        }
    }

    struct OfflineFeed;

    #[async_trait]
    impl FeedConnector for OfflineFeed {
        async fn connect(&self, _cancel: CancellationToken) -> Result<FeedLink, AppError> {
            Err(AppError::Connectivity)
        }
    }

    fn state() -> WalletSyncState {
        WalletSyncState::new(EngineDeps {
            balance_service: Arc::new(StaticBalances),
            catalog_source: Arc::new(StaticCatalog),
            feed: Arc::new(OfflineFeed),
            connectivity: Arc::new(ConnectivityFlag::default()),
        })
    }

    #[tokio::test]
    async fn commands_without_session_are_rejected() {
        let state = state();
        assert!(matches!(
            reenter_view(&state).await,
            Err(AppError::SessionNotRunning)
        ));
        assert!(matches!(
            notify_trade_submitted(&state).await,
            Err(AppError::SessionNotRunning)
        ));

        let stopped = stop_session(&state).await.expect("stop without session");
        assert!(!stopped.stopped);
        let status = session_status(&state).await.expect("status");
        assert_eq!(status.state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_spawning() {
        let state = state();
        let result = start_session(
            &state,
            Some(StartSessionArgs {
                fiat_precision: Some(12),
                ..Default::default()
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
        assert!(state.session.lock().await.is_none());
    }

    #[tokio::test]
    async fn session_lifecycle_reaches_running_and_stops() {
        let state = state();
        let mut updates = subscribe_updates(&state);

        let info = start_session(&state, None).await.expect("session starts");
        assert!(info.running);
        assert_eq!(info.display_fiat, "EUR");

        let snapshot = loop {
            let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
                .await
                .expect("snapshot before timeout")
                .expect("update channel open");
            if let EngineUpdate::Snapshot(snapshot) = update {
                break snapshot;
            }
        };
        assert_eq!(snapshot.pivot, "USDT");
        assert!(snapshot.asset("USDT").map(|usdt| usdt.is_pivot).unwrap_or(false));

        set_visible_assets(&state, Some(vec!["usdt".to_string()]))
            .await
            .expect("visible set accepted");
        assert!(matches!(
            set_visible_assets(&state, Some(vec!["bad symbol".to_string()])).await,
            Err(AppError::InvalidArgument(_))
        ));

        let stopped = stop_session(&state).await.expect("session stops");
        assert!(stopped.stopped);
        let status = session_status(&state).await.expect("status");
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.reason.as_deref(), Some("session stopped by command"));
    }
}
