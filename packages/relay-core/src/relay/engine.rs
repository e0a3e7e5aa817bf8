//! The relay engine. Routes an outer envelope to a target
//! over its live stream if one is registered, falling back to an in-memory
//! per-target queue; separately forwards a device's reply to whichever
//! client is recorded as waiting for it; and offers the durable-queue
//! fallback consumed by HTTP pull.

use thiserror::Error;

use crate::auth::AuthResolver;
use crate::relay::envelope::{EnvelopeValidationError, OuterEnvelope};
use crate::relay::registry::ConnectionRegistry;
use crate::store::{self, DbPool, Device, Direction, StoreError, User};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("device not found")]
    DeviceNotFound,
    #[error("too many envelopes queued for this target")]
    Backpressure,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Queued,
}

impl DeliveryOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// `Some(n)` caps each target's in-memory queue at `n` envelopes and returns
/// `RelayError::Backpressure` once full; `None` (the default) is unbounded.
/// The choice is a property of the engine instance, not a per-call
/// parameter, so it stays documented and stable across a deployment's
/// lifetime.
pub struct RelayEngine {
    registry: std::sync::Arc<ConnectionRegistry>,
    queue_cap: Option<usize>,
}

impl RelayEngine {
    pub fn new(registry: std::sync::Arc<ConnectionRegistry>) -> Self {
        Self { registry, queue_cap: None }
    }

    pub fn with_queue_cap(registry: std::sync::Arc<ConnectionRegistry>, cap: usize) -> Self {
        Self { registry, queue_cap: Some(cap) }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Validate an inbound outer envelope: required fields are guaranteed by
    /// `serde` deserialization already having succeeded; this checks the
    /// protocol version and, for ingress that names a target device,
    /// ownership by `user`.
    pub fn validate_envelope(
        &self,
        pool: &DbPool,
        user: &User,
        envelope: &OuterEnvelope,
    ) -> Result<Device, RelayError> {
        envelope
            .validate_version()
            .map_err(|EnvelopeValidationError::UnsupportedVersion| RelayError::UnsupportedVersion)?;
        AuthResolver::resolve_owned_device(pool, user, &envelope.device_id)
            .map_err(|_| RelayError::DeviceNotFound)
    }

    /// Route `envelope` to `target_id`. If `sender_id` names a client
    /// connection (`client_` prefix), the pending-response table is
    /// overwritten so the target's next reply routes back to it — done
    /// before the send is attempted.
    pub fn deliver(
        &self,
        target_id: &str,
        envelope: OuterEnvelope,
        sender_id: Option<&str>,
    ) -> Result<DeliveryOutcome, RelayError> {
        if let Some(sender_id) = sender_id {
            if sender_id.starts_with("client_") {
                self.registry.set_pending_response(target_id, sender_id);
            }
        }

        if self.registry.send_to(target_id, &envelope) {
            return Ok(DeliveryOutcome::Delivered);
        }

        if let Some(cap) = self.queue_cap {
            if self.registry.queue_len(target_id) >= cap {
                return Err(RelayError::Backpressure);
            }
        }
        self.registry.enqueue(target_id, envelope);
        Ok(DeliveryOutcome::Queued)
    }

    /// Forward a device's reply to whichever client is recorded as waiting
    /// for it. Returns `true` if forwarded; `false` if no client was
    /// waiting or the waiting client's stream is gone — in either case the
    /// caller persists the reply durably.
    pub fn deliver_response(&self, device_id: &str, envelope: &OuterEnvelope) -> bool {
        let client_id = match self.registry.take_pending_response(device_id) {
            Some(id) => id,
            None => return false,
        };
        self.registry.send_to(&client_id, envelope)
    }

    /// Persist `envelope` to the durable store under `direction`. This is
    /// the fallback consumed by HTTP pull — it never competes with
    /// `deliver`'s in-memory queue, the two are independent retry paths.
    pub fn enqueue_durable(
        &self,
        pool: &DbPool,
        direction: Direction,
        device_id: &str,
        device_token: Option<&str>,
        payload: &str,
        signature: &str,
    ) -> Result<(), RelayError> {
        store::insert_envelope(pool, device_id, device_token, payload, Some(signature), direction)?;
        Ok(())
    }
}
