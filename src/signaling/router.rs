use std::sync::Arc;

use super::{
    message::{Envelope, PeerId},
    registry::Registry,
};

/// What happened to one inbound frame.
///
/// Only used for diagnostics, none of these outcomes changes the state of
/// the sending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Forwarded,
    Malformed,
    Unaddressed,
    Unresolved,
    WriteFailed,
}

/// Relays peer to peer envelopes.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Route one raw frame received from `sender`.
    ///
    /// The sender field is always replaced with the identity of the
    /// connection the frame was read from. Nothing is reported back to the
    /// sender, and a failed write does not remove the target from the
    /// registry: only the target's own read cycle decides that it is gone.
    pub async fn dispatch(&self, sender: &PeerId, raw: &str) -> Dispatch {
        let mut envelope = match Envelope::decode(raw) {
            Ok(it) => it,
            Err(e) => {
                log::warn!("drop malformed frame: from={sender}, error={e}");
                return Dispatch::Malformed;
            }
        };

        envelope.from = Some(sender.to_string());

        let Some(to) = envelope.recipient() else {
            log::debug!(
                "drop frame without recipient: from={sender}, event={}",
                envelope.event
            );

            return Dispatch::Unaddressed;
        };

        let Some(target) = to
            .parse::<PeerId>()
            .ok()
            .and_then(|id| self.registry.lookup(&id))
        else {
            log::debug!(
                "drop frame for unknown peer: from={sender}, to={to:?}, event={}",
                envelope.event
            );

            return Dispatch::Unresolved;
        };

        if let Err(e) = target.write_message(&envelope).await {
            log::warn!(
                "forward failed: from={sender}, to={}, event={}, error={e}",
                target.id(),
                envelope.event
            );

            return Dispatch::WriteFailed;
        }

        log::trace!(
            "forwarded: from={sender}, to={}, event={}",
            target.id(),
            envelope.event
        );

        Dispatch::Forwarded
    }
}
