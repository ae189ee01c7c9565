use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Exchanges a refresh token for a new token pair
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ServiceError>;
}

/// Wraps backend calls with one refresh-and-retry on authorization failure.
///
/// If the refresh itself fails, stored credentials are cleared (local logout)
/// and the original failure is returned.
pub struct AuthenticatedCaller {
    credentials: Mutex<Option<TokenPair>>,
    refresher: Arc<dyn TokenRefresher>,
}

impl AuthenticatedCaller {
    pub fn new(refresher: Arc<dyn TokenRefresher>, credentials: Option<TokenPair>) -> Self {
        Self {
            credentials: Mutex::new(credentials),
            refresher,
        }
    }

    pub fn credentials(&self) -> Option<TokenPair> {
        self.credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_credentials(&self, tokens: TokenPair) {
        *self.credentials.lock().unwrap_or_else(|e| e.into_inner()) = Some(tokens);
    }

    pub fn clear(&self) {
        *self.credentials.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_logged_in(&self) -> bool {
        self.credentials().is_some()
    }

    /// Run `request` with the current access token, refreshing once on 401
    pub async fn call<T, F, Fut>(&self, request: F) -> Result<T, ServiceError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let (access, refresh) = match self.credentials() {
            Some(tokens) => (tokens.access_token, tokens.refresh_token),
            None => (String::new(), String::new()),
        };

        let first = request(access).await;
        if !matches!(&first, Err(e) if e.is_unauthorized()) {
            return first;
        }

        if refresh.trim().is_empty() {
            warn!("Access token rejected and no refresh token stored, logging out");
            self.clear();
            return first;
        }

        match self.refresher.refresh(&refresh).await {
            Ok(tokens) => {
                info!("Access token refreshed, retrying request");
                let access = tokens.access_token.clone();
                self.set_credentials(tokens);
                request(access).await
            }
            Err(e) => {
                warn!("Token refresh failed ({}), logging out", e);
                self.clear();
                first
            }
        }
    }
}
