//! Messages flowing back to the front end
//!
//! Every producer (facade, relay reader, process output pumps) writes through
//! one `Outbound`, which stamps the facade's sequence numbers and keeps the
//! order in which messages were handed over.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::{Event, Message, Response};

/// Receiving end, drained by whoever writes to the front end
pub type OutboundRx = mpsc::UnboundedReceiver<Message>;

struct OutboundInner {
    next_seq: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// Cloneable sender towards the front end
#[derive(Clone)]
pub struct Outbound {
    inner: Arc<Mutex<OutboundInner>>,
}

impl Outbound {
    pub fn channel() -> (Self, OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Self {
            inner: Arc::new(Mutex::new(OutboundInner { next_seq: 1, tx })),
        };
        (outbound, rx)
    }

    /// Send an event, stamped with the next local `seq`
    pub fn send_event(&self, event: Event) {
        self.send_stamped(Message::Event(event));
    }

    /// Send a locally produced response, stamped with the next local `seq`
    pub fn send_response(&self, response: Response) {
        self.send_stamped(Message::Response(response));
    }

    /// Send a response relayed from the remote exactly as given.
    /// The caller has already rewritten `seq`/`request_seq`.
    pub fn send_forwarded(&self, response: Response) {
        let inner = self.inner.lock();
        if inner.tx.send(Message::Response(response)).is_err() {
            tracing::debug!("Front end gone, dropping forwarded response");
        }
    }

    fn send_stamped(&self, mut message: Message) {
        // Stamp and enqueue under one lock so seq order matches queue order
        let mut inner = self.inner.lock();
        message.set_seq(inner.next_seq);
        inner.next_seq += 1;
        if inner.tx.send(message).is_err() {
            tracing::debug!("Front end gone, dropping outbound message");
        }
    }
}
