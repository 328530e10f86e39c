use crate::error::{AppError, SessionFatalKind};
use crate::market::types::{BalanceReport, BalanceReportWire};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.wallet.local";
const API_BASE_URL_ENV: &str = "WALLET_SYNC_API_URL";
const API_TOKEN_ENV: &str = "WALLET_SYNC_API_TOKEN";
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn refresh(&self, currency: &str) -> Result<BalanceReport, AppError>;
}

pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity as last reported by the host platform.
#[derive(Debug)]
pub struct ConnectivityFlag {
    online: AtomicBool,
}

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityProbe for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    pub base_url: String,
    pub token: Option<String>,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn resolve_api_endpoint() -> ApiEndpoint {
    ApiEndpoint {
        base_url: env_value(API_BASE_URL_ENV)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string(),
        token: env_value(API_TOKEN_ENV),
    }
}

pub fn build_http_client() -> Result<Client, AppError> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .build()?)
}

fn balances_endpoint(base_url: &str, currency: &str) -> String {
    format!(
        "{base_url}/v1/wallet/balances?currency={}",
        currency.to_ascii_uppercase()
    )
}

/// Maps a non-success status to the engine's error taxonomy. The session-fatal
/// statuses mirror what the auth layer reports for this API.
pub fn status_error(status: StatusCode, message: String) -> AppError {
    match status {
        StatusCode::UNAUTHORIZED => AppError::SessionFatal(SessionFatalKind::SessionExpired),
        StatusCode::FORBIDDEN => AppError::SessionFatal(SessionFatalKind::UserBlocked),
        StatusCode::UPGRADE_REQUIRED => AppError::SessionFatal(SessionFatalKind::ForceUpdate),
        _ => AppError::Service {
            status: status.as_u16(),
            message,
        },
    }
}

pub async fn check_response(response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(status_error(status, message))
}

pub fn transport_error(error: reqwest::Error) -> AppError {
    if error.is_connect() {
        AppError::Connectivity
    } else {
        AppError::Reqwest(error)
    }
}

pub struct HttpBalanceService {
    client: Client,
    endpoint: ApiEndpoint,
}

impl HttpBalanceService {
    pub fn new(client: Client, endpoint: ApiEndpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl BalanceService for HttpBalanceService {
    async fn refresh(&self, currency: &str) -> Result<BalanceReport, AppError> {
        let mut request = self
            .client
            .get(balances_endpoint(&self.endpoint.base_url, currency));
        if let Some(token) = self.endpoint.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(transport_error)?;
        let payload = check_response(response)
            .await?
            .json::<BalanceReportWire>()
            .await?;
        payload.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balances_endpoint_uses_uppercase_currency() {
        let endpoint = balances_endpoint("https://example.test", "eur");
        assert_eq!(endpoint, "https://example.test/v1/wallet/balances?currency=EUR");
    }

    #[test]
    fn auth_statuses_are_session_fatal() {
        let expired = status_error(StatusCode::UNAUTHORIZED, String::new());
        assert_eq!(expired.fatal_kind(), Some(SessionFatalKind::SessionExpired));

        let blocked = status_error(StatusCode::FORBIDDEN, String::new());
        assert_eq!(blocked.fatal_kind(), Some(SessionFatalKind::UserBlocked));

        let upgrade = status_error(StatusCode::UPGRADE_REQUIRED, String::new());
        assert_eq!(upgrade.fatal_kind(), Some(SessionFatalKind::ForceUpdate));
    }

    #[test]
    fn other_statuses_are_service_errors() {
        let error = status_error(StatusCode::BAD_GATEWAY, "upstream down".to_string());
        match error {
            AppError::Service { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn connectivity_flag_tracks_host_reports() {
        let flag = ConnectivityFlag::default();
        assert!(flag.is_online());
        flag.set_online(false);
        assert!(!flag.is_online());
    }
}
