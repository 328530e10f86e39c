use crate::market::types::{SessionState, SessionStatusSnapshot, StreamConnectionState};
use crate::{error::AppError, state::WalletSyncState};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub session: SessionState,
    pub stream: StreamConnectionState,
}

pub fn build_health_response(
    started_at: Instant,
    status: &SessionStatusSnapshot,
) -> HealthResponse {
    let health = match status.state {
        SessionState::Halted => "halted",
        SessionState::Running if status.stream != StreamConnectionState::Connected => "degraded",
        _ => "ok",
    };

    HealthResponse {
        status: health,
        uptime_ms: started_at.elapsed().as_millis(),
        session: status.state,
        stream: status.stream,
    }
}

pub async fn health(state: &WalletSyncState) -> Result<HealthResponse, AppError> {
    let status = state.status.read().await;
    Ok(build_health_response(state.started_at, &status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reports_session_and_stream() {
        let mut status = SessionStatusSnapshot::idle("EUR".to_string(), None);
        let response = build_health_response(Instant::now(), &status);
        assert_eq!(response.status, "ok");
        assert_eq!(response.session, SessionState::Idle);
        assert!(response.uptime_ms <= 1_000);

        status.state = SessionState::Running;
        assert_eq!(build_health_response(Instant::now(), &status).status, "degraded");

        status.stream = StreamConnectionState::Connected;
        assert_eq!(build_health_response(Instant::now(), &status).status, "ok");

        status.state = SessionState::Halted;
        assert_eq!(build_health_response(Instant::now(), &status).status, "halted");
    }
}
