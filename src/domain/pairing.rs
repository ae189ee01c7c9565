//! Pairing Coordinator
//!
//! Binds the identity a peripheral reports to the local user's account.
//!
//! ```text
//! AwaitingIdentity ──identity──▶ Exchanging ──resolved──▶ Ready
//!        │                           │
//!        └──no user id──▶ Error ◀────┘ service failure
//! ```
//!
//! The network exchange runs off the session's event stream: `on_identity`
//! hands out a [`PairingRequest`], the driver awaits
//! [`PairingRequest::resolve`], and feeds the [`PairingOutcome`] back through
//! [`PairingCoordinator::complete`].

use crate::domain::models::{PairingPhase, PairingSnapshot};
use crate::error::ServiceError;
use crate::infrastructure::network::{AuthenticatedCaller, PairingService};
use tracing::{debug, info, warn};

/// Persists the server-confirmed device identity locally
pub trait PairingStore {
    fn save_device_id(&mut self, device_id: &str) -> anyhow::Result<()>;
    fn device_id(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingState {
    pub esp_device_id: Option<String>,
    pub server_device_id: Option<String>,
    pub phase: PairingPhase,
}

/// Result of handing an identity to the coordinator
#[derive(Debug)]
pub enum PairingStep {
    /// A handshake is already running
    Ignored,
    /// Local precondition failed; nothing to send
    Failed,
    /// Send the user id to the peripheral, then resolve the request
    Exchange(PairingRequest),
}

/// One handshake attempt, detached from the coordinator for the network leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub attempt: u64,
    pub user_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingResolution {
    /// No server record existed
    Created,
    /// Server already had this identity
    Matched,
    /// Server held another identity; the peripheral wins
    Replaced { previous: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingFailure {
    Lookup(ServiceError),
    Update(ServiceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingOutcome {
    pub attempt: u64,
    pub device_id: String,
    pub result: Result<PairingResolution, PairingFailure>,
}

impl PairingRequest {
    /// Reconcile the peripheral identity with the server record
    pub async fn resolve(
        self,
        caller: &AuthenticatedCaller,
        service: &dyn PairingService,
    ) -> PairingOutcome {
        let result = self.reconcile(caller, service).await;
        PairingOutcome {
            attempt: self.attempt,
            device_id: self.device_id,
            result,
        }
    }

    async fn reconcile(
        &self,
        caller: &AuthenticatedCaller,
        service: &dyn PairingService,
    ) -> Result<PairingResolution, PairingFailure> {
        let user_id = self.user_id.as_str();
        let device_id = self.device_id.as_str();

        let existing = caller
            .call(move |token| async move { service.get_pairing(user_id, &token).await })
            .await
            .map_err(PairingFailure::Lookup)?;

        let resolution = match existing {
            None => PairingResolution::Created,
            Some(record) if record.device_id == device_id => return Ok(PairingResolution::Matched),
            Some(record) => PairingResolution::Replaced {
                previous: record.device_id,
            },
        };

        caller
            .call(move |token| async move {
                service.put_pairing(user_id, device_id, &token).await
            })
            .await
            .map_err(PairingFailure::Update)?;

        Ok(resolution)
    }
}

/// Owns the pairing state machine for one session
#[derive(Debug, Default)]
pub struct PairingCoordinator {
    state: PairingState,
    user_id: Option<String>,
    busy: bool,
    attempt: u64,
    status: Option<String>,
}

impl PairingCoordinator {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn set_user_id(&mut self, user_id: Option<String>) {
        self.user_id = user_id;
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    pub fn phase(&self) -> PairingPhase {
        self.state.phase
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn snapshot(&self) -> PairingSnapshot {
        PairingSnapshot {
            phase: self.state.phase,
            esp_device_id: self.state.esp_device_id.clone(),
            server_device_id: self.state.server_device_id.clone(),
            status: self.status.clone(),
        }
    }

    /// The link became ready; wait for an identity unless already paired
    pub fn on_link_ready(&mut self) {
        if self.state.phase == PairingPhase::Ready {
            return;
        }
        self.state.phase = PairingPhase::AwaitingIdentity;
        self.status = Some("Connected. Waiting for the device to report its id...".to_string());
    }

    pub fn on_identity(&mut self, identity: String) -> PairingStep {
        if self.busy {
            debug!("Pairing already in progress, ignoring identity {}", identity);
            return PairingStep::Ignored;
        }

        self.state.esp_device_id = Some(identity.clone());

        let Some(user_id) = self.user_id.clone().filter(|u| !u.trim().is_empty()) else {
            warn!("Device reported identity {} but no local user id is known", identity);
            self.state.phase = PairingPhase::Error;
            self.status = Some("Pairing error: user id is empty.".to_string());
            return PairingStep::Failed;
        };

        self.busy = true;
        self.attempt += 1;
        self.state.phase = PairingPhase::Exchanging;
        self.status = Some(format!(
            "Device id received: {identity}. Sending user id and checking server..."
        ));
        info!("Pairing attempt {} for user {} / device {}", self.attempt, user_id, identity);

        PairingStep::Exchange(PairingRequest {
            attempt: self.attempt,
            user_id,
            device_id: identity,
        })
    }

    /// Apply a network outcome. Returns `false` for outcomes of a stale attempt.
    pub fn complete(&mut self, outcome: PairingOutcome, store: &mut dyn PairingStore) -> bool {
        if !self.busy || outcome.attempt != self.attempt {
            debug!("Discarding stale pairing outcome (attempt {})", outcome.attempt);
            return false;
        }
        self.busy = false;

        let device_id = outcome.device_id;
        match outcome.result {
            Ok(resolution) => {
                if let Err(e) = store.save_device_id(&device_id) {
                    warn!("Failed to persist device id: {}", e);
                    self.state.phase = PairingPhase::Error;
                    self.status = Some(format!("Pairing failed: could not save device id: {e}"));
                    return true;
                }
                self.status = Some(match resolution {
                    PairingResolution::Created => format!("Paired OK. Device id saved: {device_id}"),
                    PairingResolution::Matched => {
                        format!("Paired OK (server matches). Device id saved: {device_id}")
                    }
                    PairingResolution::Replaced { previous } => format!(
                        "Server updated from {previous}. Device id saved: {device_id}"
                    ),
                });
                info!("Pairing confirmed for device {}", device_id);
                self.state.server_device_id = Some(device_id);
                self.state.phase = PairingPhase::Ready;
            }
            Err(failure) => {
                warn!("Pairing failed: {:?}", failure);
                self.state.phase = PairingPhase::Error;
                self.status = Some(match failure {
                    PairingFailure::Lookup(e) if e.is_forbidden() => {
                        "Forbidden (403): not allowed to access pairing.".to_string()
                    }
                    PairingFailure::Lookup(e) => format!("Failed to check server: {e}"),
                    PairingFailure::Update(e) => format!("Failed to update server: {e}"),
                });
            }
        }
        true
    }

    /// Session went away: drop in-flight work, keep a confirmed pairing
    pub fn on_disconnected(&mut self) {
        self.busy = false;
        // Outcomes of the attempt still on the wire no longer apply
        self.attempt += 1;
        if self.state.phase != PairingPhase::Ready {
            self.state = PairingState::default();
            self.status = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::auth::testing::{tokens, FixedRefresher};
    use crate::infrastructure::network::pairing_api::testing::MemoryPairingService;
    use std::sync::Arc;

    #[derive(Default)]
    struct MemoryStore {
        device_id: Option<String>,
        fail: bool,
    }

    impl PairingStore for MemoryStore {
        fn save_device_id(&mut self, device_id: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.device_id = Some(device_id.to_string());
            Ok(())
        }

        fn device_id(&self) -> Option<String> {
            self.device_id.clone()
        }
    }

    fn caller() -> AuthenticatedCaller {
        AuthenticatedCaller::new(Arc::new(FixedRefresher::ok("fresh")), Some(tokens("t")))
    }

    async fn run(
        coordinator: &mut PairingCoordinator,
        service: &MemoryPairingService,
        store: &mut MemoryStore,
        identity: &str,
    ) {
        let PairingStep::Exchange(request) = coordinator.on_identity(identity.to_string()) else {
            panic!("expected an exchange");
        };
        let outcome = request.resolve(&caller(), service).await;
        assert!(coordinator.complete(outcome, store));
    }

    #[tokio::test]
    async fn test_not_found_creates_pairing() {
        let service = MemoryPairingService::default();
        let mut store = MemoryStore::default();
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));
        coordinator.on_link_ready();

        run(&mut coordinator, &service, &mut store, "DEV1").await;

        assert_eq!(coordinator.phase(), PairingPhase::Ready);
        assert_eq!(service.put_calls(), vec![("alice".to_string(), "DEV1".to_string())]);
        assert_eq!(store.device_id(), Some("DEV1".to_string()));
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_mismatch_replaces_server_record() {
        let service = MemoryPairingService::with_record("alice", "DEV2");
        let mut store = MemoryStore::default();
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));

        run(&mut coordinator, &service, &mut store, "DEV1").await;

        assert_eq!(coordinator.phase(), PairingPhase::Ready);
        assert_eq!(service.put_calls(), vec![("alice".to_string(), "DEV1".to_string())]);
        assert_eq!(coordinator.state().server_device_id.as_deref(), Some("DEV1"));
    }

    #[tokio::test]
    async fn test_match_needs_no_write() {
        let service = MemoryPairingService::with_record("alice", "DEV1");
        let mut store = MemoryStore::default();
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));

        run(&mut coordinator, &service, &mut store, "DEV1").await;

        assert_eq!(coordinator.phase(), PairingPhase::Ready);
        assert!(service.put_calls().is_empty());
        assert_eq!(store.device_id(), Some("DEV1".to_string()));
    }

    #[tokio::test]
    async fn test_lookup_failure_ends_in_error_without_writes() {
        let service = MemoryPairingService {
            lookup_error: Some(ServiceError::Transport("connection refused".to_string())),
            ..Default::default()
        };
        let mut store = MemoryStore::default();
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));

        run(&mut coordinator, &service, &mut store, "DEV1").await;

        assert_eq!(coordinator.phase(), PairingPhase::Error);
        assert!(service.put_calls().is_empty());
        assert!(coordinator.status().unwrap().starts_with("Failed to check server"));
        // Known identity is kept for a retry
        assert_eq!(coordinator.state().esp_device_id.as_deref(), Some("DEV1"));
        assert_eq!(store.device_id(), None);
    }

    #[tokio::test]
    async fn test_forbidden_lookup_message() {
        let service = MemoryPairingService {
            lookup_error: Some(ServiceError::Http {
                status: 403,
                body: String::new(),
            }),
            ..Default::default()
        };
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));
        run(&mut coordinator, &service, &mut MemoryStore::default(), "DEV1").await;
        assert_eq!(
            coordinator.status(),
            Some("Forbidden (403): not allowed to access pairing.")
        );
    }

    #[tokio::test]
    async fn test_update_failure_ends_in_error() {
        let service = MemoryPairingService {
            write_error: Some(ServiceError::Http {
                status: 500,
                body: "boom".to_string(),
            }),
            ..Default::default()
        };
        let mut store = MemoryStore::default();
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));

        run(&mut coordinator, &service, &mut store, "DEV1").await;

        assert_eq!(coordinator.phase(), PairingPhase::Error);
        assert_eq!(service.put_calls().len(), 1);
        assert_eq!(store.device_id(), None);
    }

    #[tokio::test]
    async fn test_store_failure_ends_in_error() {
        let service = MemoryPairingService::default();
        let mut store = MemoryStore {
            fail: true,
            ..Default::default()
        };
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));
        run(&mut coordinator, &service, &mut store, "DEV1").await;
        assert_eq!(coordinator.phase(), PairingPhase::Error);
    }

    #[test]
    fn test_missing_user_id_is_an_error() {
        let mut coordinator = PairingCoordinator::new(None);
        assert!(matches!(
            coordinator.on_identity("DEV1".to_string()),
            PairingStep::Failed
        ));
        assert_eq!(coordinator.phase(), PairingPhase::Error);
        assert!(!coordinator.is_busy());
    }

    #[test]
    fn test_duplicate_identity_while_busy_is_ignored() {
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));
        assert!(matches!(
            coordinator.on_identity("DEV1".to_string()),
            PairingStep::Exchange(_)
        ));
        assert!(matches!(
            coordinator.on_identity("DEV1".to_string()),
            PairingStep::Ignored
        ));
        assert!(matches!(
            coordinator.on_identity("DEV9".to_string()),
            PairingStep::Ignored
        ));
        assert_eq!(coordinator.state().esp_device_id.as_deref(), Some("DEV1"));
    }

    #[test]
    fn test_outcome_after_disconnect_is_discarded() {
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));
        let PairingStep::Exchange(request) = coordinator.on_identity("DEV1".to_string()) else {
            panic!("expected an exchange");
        };
        coordinator.on_disconnected();

        let outcome = PairingOutcome {
            attempt: request.attempt,
            device_id: request.device_id,
            result: Ok(PairingResolution::Created),
        };
        let mut store = MemoryStore::default();
        assert!(!coordinator.complete(outcome, &mut store));
        assert_eq!(coordinator.phase(), PairingPhase::AwaitingIdentity);
        assert_eq!(store.device_id(), None);
    }

    #[tokio::test]
    async fn test_ready_pairing_survives_disconnect_and_ready() {
        let service = MemoryPairingService::default();
        let mut store = MemoryStore::default();
        let mut coordinator = PairingCoordinator::new(Some("alice".to_string()));
        run(&mut coordinator, &service, &mut store, "DEV1").await;

        coordinator.on_disconnected();
        coordinator.on_link_ready();
        assert_eq!(coordinator.phase(), PairingPhase::Ready);
        assert_eq!(coordinator.state().server_device_id.as_deref(), Some("DEV1"));
    }
}
