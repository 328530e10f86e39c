pub mod commands;
pub mod engine;
pub mod error;
pub mod market;
pub mod state;
pub mod telemetry;
pub mod wallet;

pub use engine::pipeline::{run_engine, EngineCommand, EngineDeps};
pub use error::{AppError, SessionFatalKind};
pub use market::types::{
    EngineUpdate, PortfolioSnapshot, SessionConfig, SessionState, SessionStatusSnapshot,
    StartSessionArgs,
};
pub use state::WalletSyncState;
