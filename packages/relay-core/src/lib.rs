//! Core of the WakeLink blind relay: entity store, auth resolver, connection
//! registry, and relay engine. No HTTP or WebSocket framework dependency —
//! `relay-server` wires this into axum.

pub mod auth;
pub mod relay;
pub mod store;

pub use auth::{AuthError, AuthResolver};
pub use relay::engine::{DeliveryOutcome, RelayEngine, RelayError};
pub use relay::envelope::OuterEnvelope;
pub use relay::registry::{ConnectionRegistry, DeliverySink};
pub use store::models::{Device, Direction, Envelope, MessageType, User};
pub use store::{DbPool, StoreError};

/// A device is online if it was seen within this window, even with no live
/// stream registered.
pub const PRESENCE_WINDOW_SECS: i64 = 300;
