//! Protocol relay towards the remote debugger
//!
//! Runs a second, inward-facing protocol session over the transport. It has
//! its own request sequence space, so responses coming back have to be
//! matched through the pending table before the facade rewrites them for
//! the front end. Events are passed straight to the front end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::protocol::{read_frame, write_message, Frame, Message, Request, Response};
use crate::session::Outbound;
use crate::{Error, Result};

/// Upper bound on flushing and closing the writer during dispose
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outstanding requests keyed by the relay's own `seq`
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
}

impl PendingRequests {
    fn insert(&self, seq: u64) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(seq, tx);
        rx
    }

    fn remove(&self, seq: u64) {
        self.waiters.lock().remove(&seq);
    }

    /// Hand a response to whoever waits for it. Returns `false` when no
    /// outstanding request matches.
    fn resolve(&self, response: Response) -> bool {
        let waiter = self.waiters.lock().remove(&response.request_seq);
        match waiter {
            Some(tx) => {
                // The waiter may have just timed out; that's fine
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }

    /// Drop every waiter; they observe a closed channel
    fn clear(&self) {
        self.waiters.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A request already on the wire whose answer hasn't arrived yet.
///
/// Dropping it gives up on the answer and frees the table entry.
pub struct PendingResponse {
    seq: u64,
    command: String,
    rx: Option<oneshot::Receiver<Response>>,
    pending: Arc<PendingRequests>,
}

impl PendingResponse {
    /// Relay `seq` the request went out with
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait up to `timeout` for the answer
    pub async fn wait(mut self, timeout: Duration) -> Result<Response> {
        let rx = self.rx.take().ok_or(Error::RelayClosed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::RelayClosed),
            Err(_) => Err(Error::Timeout(self.command.clone())),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.remove(self.seq);
    }
}

/// Inward-facing session over the debugger transport
pub struct ProtocolRelay {
    /// Also guards `next_seq`, so requests hit the wire in seq order
    writer: tokio::sync::Mutex<WriterSlot>,
    pending: Arc<PendingRequests>,
    closed: Arc<watch::Sender<bool>>,
    disposed: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

struct WriterSlot {
    writer: Option<BoxedWriter>,
    next_seq: u64,
}

impl WriterSlot {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

impl ProtocolRelay {
    /// Take over `stream` and start reading from it
    pub fn start<S>(stream: S, outbound: Outbound) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let pending = Arc::new(PendingRequests::default());
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let reader_task = tokio::spawn(reader_loop(
            reader,
            pending.clone(),
            closed.clone(),
            outbound,
        ));

        Arc::new(Self {
            writer: tokio::sync::Mutex::new(WriterSlot {
                writer: Some(Box::new(writer)),
                next_seq: 1,
            }),
            pending,
            closed,
            disposed: AtomicBool::new(false),
            reader_task: Mutex::new(Some(reader_task)),
        })
    }

    /// Send a request to the remote and wait up to `timeout` for its answer.
    ///
    /// The returned response still carries the remote's numbering.
    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<Response> {
        self.submit(command, arguments).await?.wait(timeout).await
    }

    /// Write a request and register for its answer without waiting for it.
    ///
    /// Requests submitted one after another reach the remote in that order.
    pub async fn submit(&self, command: &str, arguments: Option<JsonValue>) -> Result<PendingResponse> {
        let mut slot = self.writer.lock().await;
        let seq = slot.take_seq();
        let pending = PendingResponse {
            seq,
            command: command.to_string(),
            rx: Some(self.pending.insert(seq)),
            pending: self.pending.clone(),
        };
        // Registered first, so a reader shutting down right now still fails it
        if self.is_closed() {
            return Err(Error::RelayClosed);
        }

        let writer = slot.writer.as_mut().ok_or(Error::RelayClosed)?;
        let request = Message::Request(Request::new(seq, command, arguments));
        write_message(writer, &request).await?;
        tracing::debug!("Forwarded '{}' to remote as seq {}", command, seq);

        Ok(pending)
    }

    /// Write a request without waiting for or tracking its response. The
    /// whole write, including waiting for the writer, must fit in `budget`.
    pub async fn send_detached(
        &self,
        command: &str,
        arguments: Option<JsonValue>,
        budget: Duration,
    ) -> Result<()> {
        let write = async {
            let mut slot = self.writer.lock().await;
            let seq = slot.take_seq();
            let writer = slot.writer.as_mut().ok_or(Error::RelayClosed)?;
            write_message(writer, &Message::Request(Request::new(seq, command, arguments))).await
        };
        tokio::time::timeout(budget, write)
            .await
            .map_err(|_| Error::Timeout(command.to_string()))?
    }

    /// Number of requests still waiting for an answer
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the remote side has gone away or the relay was disposed
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the relay is closed, from either end
    pub async fn closed(&self) {
        let mut closed_rx = self.closed.subscribe();
        while !*closed_rx.borrow_and_update() {
            if closed_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop reading, close the transport and fail outstanding requests.
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.closed.send_replace(true);
        self.pending.clear();

        let close = async {
            if let Some(mut writer) = self.writer.lock().await.writer.take() {
                let _ = writer.shutdown().await;
            }
        };
        if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, close).await.is_err() {
            tracing::warn!("Transport writer did not close in time, abandoning it");
        }

        tracing::debug!("Relay disposed");
    }
}

async fn reader_loop<R>(
    reader: R,
    pending: Arc<PendingRequests>,
    closed: Arc<watch::Sender<bool>>,
    outbound: Outbound,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Message(message))) => route_inbound(message, &pending, &outbound),
            Ok(Some(Frame::Malformed(e))) => {
                tracing::warn!("Dropping message from remote: {}", e);
            }
            Ok(None) => {
                tracing::warn!("Remote debugger closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading from remote debugger: {}", e);
                break;
            }
        }
    }

    closed.send_replace(true);
    pending.clear();
}

/// Events go upstream in read order; responses are correlated by
/// `request_seq` (events carry none, so they never match a waiter).
fn route_inbound(message: Message, pending: &PendingRequests, outbound: &Outbound) {
    match message {
        Message::Event(event) => {
            tracing::debug!("Remote event: {}", event.event);
            outbound.send_event(event);
        }
        Message::Response(response) => {
            let request_seq = response.request_seq;
            let command = response.command.clone();
            if !pending.resolve(response) {
                tracing::debug!(
                    "Dropping response to '{}' (request_seq {}): nothing waiting for it",
                    command,
                    request_seq
                );
            }
        }
        Message::Request(request) => {
            tracing::debug!("Ignoring request '{}' from remote", request.command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Event;
    use crate::test_helpers::{recv, FakeRemote};
    use serde_json::json;

    fn relay_with_remote() -> (Arc<ProtocolRelay>, FakeRemote, crate::session::OutboundRx) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (outbound, rx) = Outbound::channel();
        (ProtocolRelay::start(ours, outbound), FakeRemote::new(theirs), rx)
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_seq() {
        let (relay, mut remote, _rx) = relay_with_remote();

        let remote_task = tokio::spawn(async move {
            let first = remote.next_request().await.unwrap();
            let second = remote.next_request().await.unwrap();
            // Answer in reverse order
            remote.reply(&second, Some(json!({"from": second.command}))).await;
            remote.reply(&first, Some(json!({"from": first.command}))).await;
            remote
        });

        let timeout = Duration::from_secs(5);
        let (threads, stack) = tokio::join!(
            relay.send_request("threads", None, timeout),
            relay.send_request("stackTrace", Some(json!({"threadId": 1})), timeout),
        );

        assert_eq!(threads.unwrap().body, Some(json!({"from": "threads"})));
        assert_eq!(stack.unwrap().body, Some(json!({"from": "stackTrace"})));
        assert_eq!(relay.pending_count(), 0);
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_keep_wire_order() {
        let (_relay, mut remote, mut rx) = relay_with_remote();

        for i in 0..50 {
            remote.event("output", Some(json!({"output": i.to_string()}))).await;
        }

        for i in 0..50 {
            let Message::Event(event) = recv(&mut rx).await else {
                panic!("expected event");
            };
            assert_eq!(event.body.unwrap()["output"], json!(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_stop_relay() {
        let (_relay, mut remote, mut rx) = relay_with_remote();

        remote.send_raw(b"Content-Length: 5\r\n\r\n{oops").await;
        remote
            .send_raw(b"Content-Length: 30\r\n\r\n{\"seq\":1,\"type\":\"telemetry\"}  ")
            .await;
        remote.event("stopped", Some(json!({"reason": "breakpoint"}))).await;

        let Message::Event(event) = recv(&mut rx).await else {
            panic!("expected event");
        };
        assert_eq!(event.event, "stopped");
    }

    #[tokio::test]
    async fn test_bad_headers_and_oversized_frames_do_not_close_relay() {
        let (relay, mut remote, mut rx) = relay_with_remote();

        let remote_task = tokio::spawn(async move {
            remote.send_raw(b"X-Junk: \xff\xfe\r\nContent-Length: 2\r\n\r\n{}").await;
            let oversized = crate::protocol::codec::MAX_FRAME_SIZE + 1;
            remote
                .send_raw(format!("Content-Length: {}\r\n\r\n", oversized).as_bytes())
                .await;
            remote.send_raw(&vec![b' '; oversized]).await;
            remote.event("stopped", Some(json!({"reason": "pause"}))).await;
            remote
        });

        let Message::Event(event) = recv(&mut rx).await else {
            panic!("expected event");
        };
        assert_eq!(event.event, "stopped");
        assert!(!relay.is_closed());
        remote_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_without_success_field_resolves() {
        let (relay, mut remote, _rx) = relay_with_remote();

        let remote_task = tokio::spawn(async move {
            let request = remote.next_request().await.unwrap();
            let raw = format!(
                r#"{{"seq":5,"type":"response","request_seq":{},"command":"threads","body":{{"threads":[]}}}}"#,
                request.seq
            );
            remote
                .send_raw(format!("Content-Length: {}\r\n\r\n{}", raw.len(), raw).as_bytes())
                .await;
            remote
        });

        let response = relay
            .send_request("threads", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.body, Some(json!({"threads": []})));
        remote_task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_hit_the_wire_in_seq_order() {
        let (relay, mut remote, _rx) = relay_with_remote();

        let mut senders = Vec::new();
        for i in 0..100 {
            let relay = relay.clone();
            senders.push(tokio::spawn(async move {
                let _ = relay
                    .send_detached("evaluate", Some(json!({"expression": i})), Duration::from_secs(5))
                    .await;
            }));
        }

        let mut last_seq = 0;
        for _ in 0..100 {
            let request = remote.next_request().await.unwrap();
            assert!(request.seq > last_seq, "seq {} after {}", request.seq, last_seq);
            last_seq = request.seq;
        }
        for sender in senders {
            sender.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_submit_returns_once_written() {
        let (relay, mut remote, _rx) = relay_with_remote();

        let pending = relay.submit("pause", None).await.unwrap();
        let request = remote.next_request().await.unwrap();
        assert_eq!(request.seq, pending.seq());
        assert_eq!(relay.pending_count(), 1);

        remote.reply(&request, None).await;
        let response = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.command, "pause");
        assert_eq!(relay.pending_count(), 0);

        // Giving up on an answer frees its entry
        let abandoned = relay.submit("continue", None).await.unwrap();
        assert_eq!(relay.pending_count(), 1);
        drop(abandoned);
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_resolves_when_remote_hangs_up() {
        let (relay, remote, _rx) = relay_with_remote();
        drop(remote);

        tokio::time::timeout(Duration::from_secs(5), relay.closed())
            .await
            .expect("relay should notice the hangup");
        assert!(relay.is_closed());
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let (relay, mut remote, mut rx) = relay_with_remote();

        let stray = Request::new(999, "threads", None);
        remote.reply(&stray, None).await;
        remote.event("continued", None).await;

        // Only the event reaches the front end
        let Message::Event(event) = recv(&mut rx).await else {
            panic!("expected event");
        };
        assert_eq!(event.event, "continued");
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_pending_entry() {
        let (relay, mut remote, _rx) = relay_with_remote();

        let swallow = tokio::spawn(async move { while remote.next_request().await.is_some() {} });

        let result = relay
            .send_request("pause", None, Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(Error::Timeout(ref c)) if c == "pause"));
        assert_eq!(relay.pending_count(), 0);

        relay.dispose().await;
        swallow.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_dropped() {
        let (relay, mut remote, _rx) = relay_with_remote();

        let result = relay
            .send_request("evaluate", None, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let request = remote.next_request().await.unwrap();
        remote.reply(&request, None).await;
        remote.event("marker", None).await;

        // Give the reader a moment; the late answer matches nothing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_fails_waiters_and_is_idempotent() {
        let (relay, mut remote, _rx) = relay_with_remote();

        let waiting = {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay
                    .send_request("continue", None, Duration::from_secs(30))
                    .await
            })
        };
        remote.next_request().await.unwrap();

        relay.dispose().await;
        relay.dispose().await;

        assert!(matches!(waiting.await.unwrap(), Err(Error::RelayClosed)));
        assert!(relay.is_closed());
        assert!(matches!(
            relay.send_request("threads", None, Duration::from_secs(1)).await,
            Err(Error::RelayClosed)
        ));
        // The remote sees the transport close
        assert!(remote.next_request().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_hangup_fails_waiters() {
        let (relay, remote, _rx) = relay_with_remote();
        drop(remote);

        let result = relay
            .send_request("threads", None, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(Error::RelayClosed) | Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_detached_request_is_not_tracked() {
        let (relay, mut remote, _rx) = relay_with_remote();

        relay
            .send_detached("disconnect", Some(json!({"terminateDebuggee": true})), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(relay.pending_count(), 0);

        let request = remote.next_request().await.unwrap();
        assert_eq!(request.command, "disconnect");
        assert_eq!(request.arguments, Some(json!({"terminateDebuggee": true})));
    }

    #[test]
    fn test_pending_table_resolves_once() {
        let pending = PendingRequests::default();
        let mut rx = pending.insert(4);
        let response = Response::success(&Request::new(4, "next", None));

        assert!(pending.resolve(response.clone()));
        assert!(!pending.resolve(response));
        assert!(pending.is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_event_never_matches_waiter() {
        let pending = PendingRequests::default();
        let _rx = pending.insert(1);
        let (outbound, mut out_rx) = Outbound::channel();

        route_inbound(Message::Event(Event::new("stopped", None)), &pending, &outbound);
        assert_eq!(pending.len(), 1);
        assert!(matches!(out_rx.try_recv(), Ok(Message::Event(_))));
    }
}
