use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use wallet_sync::commands::session::{start_session, stop_session, subscribe_updates};
use wallet_sync::market::stream::{resolve_stream_url, WebSocketFeedConnector};
use wallet_sync::telemetry::{init_tracing, resolve_log_filter};
use wallet_sync::wallet::catalog::HttpAssetCatalogSource;
use wallet_sync::wallet::service::{
    build_http_client, resolve_api_endpoint, ConnectivityFlag, HttpBalanceService,
};
use wallet_sync::{AppError, EngineDeps, EngineUpdate, WalletSyncState};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing(&resolve_log_filter())?;

    let client = build_http_client()?;
    let endpoint = resolve_api_endpoint();
    let stream_url = resolve_stream_url();
    info!(api = %endpoint.base_url, stream = %stream_url, "starting wallet sync");

    let state = WalletSyncState::new(EngineDeps {
        balance_service: Arc::new(HttpBalanceService::new(client.clone(), endpoint.clone())),
        catalog_source: Arc::new(HttpAssetCatalogSource::new(client, endpoint)),
        feed: Arc::new(WebSocketFeedConnector::new(stream_url)),
        connectivity: Arc::new(ConnectivityFlag::default()),
    });
    let mut updates = subscribe_updates(&state);
    start_session(&state, None).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(error) = signal {
                    warn!(error = %error, "failed to listen for shutdown signal");
                }
                break;
            }
            update = updates.recv() => match update {
                Ok(EngineUpdate::Snapshot(snapshot)) => info!(
                    sequence = snapshot.sequence,
                    total = %snapshot.total_fiat_value,
                    fiat = %snapshot.display_fiat,
                    assets = snapshot.assets().count(),
                    "portfolio snapshot"
                ),
                Ok(EngineUpdate::ServiceError(message)) => {
                    warn!(message = %message, "balance service error")
                }
                Ok(EngineUpdate::ConsentRequired(url)) => {
                    warn!(url = %url, "consent required before balances can load")
                }
                Ok(EngineUpdate::StreamState(stream)) => info!(?stream, "ticker feed state"),
                Ok(EngineUpdate::SessionHalted(kind)) => {
                    error!(reason = kind.as_str(), "session halted");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "update consumer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    let stopped = stop_session(&state).await?;
    info!(stopped = stopped.stopped, "wallet sync stopped");
    Ok(())
}
