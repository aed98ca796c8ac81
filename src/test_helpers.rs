//! Shared test fixtures: an in-memory stand-in for the remote debugger.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::Instant;

use crate::debuggee::Connect;
use crate::protocol::{read_frame, write_message, Event, Frame, Message, Request, Response};
use crate::session::OutboundRx;

/// The far end of a relay transport
pub struct FakeRemote {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    next_seq: u64,
}

impl FakeRemote {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            next_seq: 1000,
        }
    }

    /// Next request written by the relay, or `None` once it hung up
    pub async fn next_request(&mut self) -> Option<Request> {
        loop {
            match read_frame(&mut self.reader).await {
                Ok(Some(Frame::Message(Message::Request(request)))) => return Some(request),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Answer `request` successfully with `body`, using the remote's own seq
    pub async fn reply(&mut self, request: &Request, body: Option<JsonValue>) {
        let mut response = Response::success(request);
        response.seq = self.take_seq();
        response.body = body;
        self.send(Message::Response(response)).await;
    }

    pub async fn event(&mut self, name: &str, body: Option<JsonValue>) {
        let mut event = Event::new(name, body);
        event.seq = self.take_seq();
        self.send(Message::Event(event)).await;
    }

    pub async fn send(&mut self, message: Message) {
        write_message(&mut self.writer, &message).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.writer.write_all(bytes).await.unwrap();
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Connector handing out pre-made duplex streams. The first `hang_first`
/// attempts never complete; once the streams run out it refuses.
#[derive(Default)]
pub struct DuplexConnector {
    streams: Mutex<Vec<DuplexStream>>,
    hang_first: u32,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl DuplexConnector {
    /// Connector with one stream ready, plus the remote end of it
    pub fn with_remote() -> (Self, FakeRemote) {
        Self::hanging(0)
    }

    /// Like [`DuplexConnector::with_remote`], but the first `hang_first`
    /// attempts hang until they time out
    pub fn hanging(hang_first: u32) -> (Self, FakeRemote) {
        Self::build(hang_first, 64 * 1024)
    }

    /// Connector whose transport buffers only `capacity` bytes each way
    pub fn with_capacity(capacity: usize) -> (Self, FakeRemote) {
        Self::build(0, capacity)
    }

    fn build(hang_first: u32, capacity: usize) -> (Self, FakeRemote) {
        let (ours, theirs) = tokio::io::duplex(capacity);
        let connector = Self {
            streams: Mutex::new(vec![ours]),
            hang_first,
            attempts: Arc::default(),
        };
        (connector, FakeRemote::new(theirs))
    }

    /// Connector that always refuses
    pub fn refusing() -> Self {
        Self::default()
    }

    /// Start times of every attempt; stays readable after the connector
    /// has been handed to a session
    pub fn attempt_log(&self) -> Arc<Mutex<Vec<Instant>>> {
        self.attempts.clone()
    }
}

impl Connect for DuplexConnector {
    type Stream = DuplexStream;

    fn connect(&self, _host: &str, _port: u16) -> impl Future<Output = std::io::Result<DuplexStream>> + Send {
        let attempt = {
            let mut attempts = self.attempts.lock();
            attempts.push(Instant::now());
            attempts.len() as u32
        };
        let stream = if attempt > self.hang_first {
            self.streams.lock().pop()
        } else {
            None
        };
        let hang = attempt <= self.hang_first;
        async move {
            if hang {
                std::future::pending::<()>().await;
            }
            stream.ok_or_else(|| std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        }
    }
}

/// Wait for the next outbound message, failing the test after a while
pub async fn recv(rx: &mut OutboundRx) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound channel closed")
}

/// Next outbound message that isn't a runtime `output` event
pub async fn recv_non_output(rx: &mut OutboundRx) -> Message {
    loop {
        match recv(rx).await {
            Message::Event(event) if event.event == "output" => continue,
            other => return other,
        }
    }
}
