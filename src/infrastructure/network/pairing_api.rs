use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Server-side association between a user account and a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePairing {
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub paired_at: Option<String>,
}

/// Account backend endpoints used by the pairing handshake
#[async_trait]
pub trait PairingService: Send + Sync {
    /// Current pairing for `user_id`; `Ok(None)` when the user is not paired
    async fn get_pairing(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<Option<DevicePairing>, ServiceError>;

    /// Create or replace the pairing for `user_id`
    async fn put_pairing(
        &self,
        user_id: &str,
        device_id: &str,
        access_token: &str,
    ) -> Result<DevicePairing, ServiceError>;
}
