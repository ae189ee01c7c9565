//! Network collaborators
//!
//! The account backend itself is external. This module fixes the shapes the
//! link engine consumes from it:
//!
//! - [`auth`] - Authenticated call wrapper (refresh once on 401, then retry)
//! - [`pairing_api`] - Pairing service contract and record types

pub mod auth;
pub mod pairing_api;

pub use auth::{AuthenticatedCaller, TokenPair, TokenRefresher};
pub use pairing_api::{DevicePairing, PairingService};
