use crate::engine::pipeline::{EngineCommand, EngineDeps};
use crate::error::AppError;
use crate::market::types::{EngineUpdate, SessionStatusSnapshot, DEFAULT_DISPLAY_FIAT};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

pub struct SessionHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<Result<(), AppError>>,
    pub commands: mpsc::UnboundedSender<EngineCommand>,
}

pub struct WalletSyncState {
    pub started_at: Instant,
    pub deps: EngineDeps,
    pub session: Mutex<Option<SessionHandle>>,
    pub status: Arc<RwLock<SessionStatusSnapshot>>,
    pub updates: broadcast::Sender<EngineUpdate>,
}

impl WalletSyncState {
    pub fn new(deps: EngineDeps) -> Self {
        let status = SessionStatusSnapshot::idle(
            DEFAULT_DISPLAY_FIAT.to_string(),
            Some("no session started".to_string()),
        );
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            started_at: Instant::now(),
            deps,
            session: Mutex::new(None),
            status: Arc::new(RwLock::new(status)),
            updates,
        }
    }
}
