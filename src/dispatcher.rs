//! Correlates outbound requests to inbound replies by random token, and
//! distinguishes solicited replies from unsolicited inbound requests.
//!
//! The dispatcher itself does not own a clock or a socket: it is driven
//! entirely from the single event-loop task in [`crate::session`], which
//! calls [`Dispatcher::begin`] before sending a datagram and
//! [`Dispatcher::dispatch`] on every datagram received.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::codec::{Envelope, MessageType};
use crate::error::DhtError;
use crate::id::Id;

/// Which reply type(s) a pending request will accept. A `FindValueRequest`
/// is the only RPC with two acceptable replies (hit or fallback miss).
#[derive(Clone, Copy, Debug)]
pub enum Expected {
    PingResponse,
    FindPeerResponse,
    FindValueOrPeerResponse,
}

impl Expected {
    fn accepts(&self, message_type: MessageType) -> bool {
        match self {
            Expected::PingResponse => message_type == MessageType::PingResponse,
            Expected::FindPeerResponse => message_type == MessageType::FindPeerResponse,
            Expected::FindValueOrPeerResponse => matches!(
                message_type,
                MessageType::FindValueResponse | MessageType::FindPeerResponse
            ),
        }
    }
}

struct PendingEntry {
    expected: Expected,
    reply_tx: oneshot::Sender<Envelope>,
}

/// Outcome of feeding one inbound datagram to the dispatcher.
pub enum Dispatched {
    /// The datagram completed a pending request; its continuation has
    /// already been woken.
    Matched,
    /// No pending request claims this datagram; the caller must route it
    /// to the inbound request handler.
    Unsolicited(Envelope),
}

#[derive(Default)]
pub struct Dispatcher {
    pending: HashMap<Id, PendingEntry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            pending: HashMap::new(),
        }
    }

    /// Reserves a fresh random token and registers what reply it accepts.
    /// Returns the token to embed in the outgoing header plus a receiver
    /// that resolves when a matching reply arrives (or never, if the
    /// caller times it out and calls [`Dispatcher::cancel`]).
    pub fn begin(&mut self, expected: Expected) -> Result<(Id, oneshot::Receiver<Envelope>), DhtError> {
        let token = Id::random();
        if self.pending.contains_key(&token) {
            // 160-bit random collision against a live request: statistically
            // negligible, but must not silently clobber existing state.
            return Err(DhtError::InvariantViolation(format!(
                "token collision on {token:?}"
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            token,
            PendingEntry {
                expected,
                reply_tx: tx,
            },
        );
        Ok((token, rx))
    }

    /// Feeds one inbound, already-decoded datagram to the dispatcher.
    pub fn dispatch(&mut self, envelope: Envelope) -> Dispatched {
        let matches = self
            .pending
            .get(&envelope.header.random_token)
            .map(|entry| entry.expected.accepts(envelope.header.message_type))
            .unwrap_or(false);
        if matches {
            if let Some(entry) = self.pending.remove(&envelope.header.random_token) {
                let _ = entry.reply_tx.send(envelope);
                return Dispatched::Matched;
            }
        }
        Dispatched::Unsolicited(envelope)
    }

    /// Drops a request's entry after its deadline elapsed without a reply.
    pub fn cancel(&mut self, token: &Id) {
        self.pending.remove(token);
    }

    /// Resolves every outstanding request with `Aborted` by dropping its
    /// sender half, waking every awaiting `send_request` call.
    pub fn abort_all(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
