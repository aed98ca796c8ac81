//! The session facade the front end talks to
//!
//! Owns the state machine and orchestrates the process supervisor, the
//! connection manager and the protocol relay. All mutable session state sits
//! behind one lock that is never held across an await.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::dispatch::{self, Policy};
use super::outbound::{Outbound, OutboundRx};
use crate::config::{RelayConfig, SessionConfig};
use crate::debuggee::{
    ChildHandle, Connect, ConnectionManager, LaunchSpec, ProcessExit, ProcessSupervisor,
    ProtocolRelay, RetryPolicy, TcpConnector,
};
use crate::protocol::{read_frame, write_message, Event, Frame, Message, Request, Response};
use crate::state::{ConnectionState, SessionState};
use crate::{Error, Result};

/// Builder for [`DebugSession`]
pub struct SessionBuilder<C: Connect = TcpConnector> {
    config: SessionConfig,
    relay_config: RelayConfig,
    launch: Option<LaunchSpec>,
    connector: C,
}

impl SessionBuilder<TcpConnector> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            relay_config: RelayConfig::default(),
            launch: None,
            connector: TcpConnector,
        }
    }
}

impl<C: Connect> SessionBuilder<C> {
    pub fn relay_config(mut self, relay_config: RelayConfig) -> Self {
        self.relay_config = relay_config;
        self
    }

    /// Run this command instead of the build-tool wrapper derived from the
    /// session configuration
    pub fn launch(mut self, launch: LaunchSpec) -> Self {
        self.launch = Some(launch);
        self
    }

    /// Use another way of reaching the debug server
    pub fn connector<D: Connect>(self, connector: D) -> SessionBuilder<D> {
        SessionBuilder {
            config: self.config,
            relay_config: self.relay_config,
            launch: self.launch,
            connector,
        }
    }

    pub fn build(self) -> DebugSession<C> {
        let (outbound, outbound_rx) = Outbound::channel();
        let (shutdown_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        let policy = RetryPolicy::from(&self.relay_config);
        let id = Uuid::new_v4();

        tracing::debug!("Created debug session {}", id);

        DebugSession {
            inner: Arc::new(SessionInner {
                id,
                config: self.config,
                relay_config: self.relay_config,
                launch: self.launch,
                connections: ConnectionManager::new(self.connector, policy),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                shutdown_tx,
                state_tx,
                core: Mutex::new(SessionCore {
                    state: SessionState::Uninitialized,
                    connection: ConnectionState::Disconnected,
                    process: None,
                    child: None,
                    relay: None,
                    terminated_sent: false,
                }),
            }),
        }
    }
}

/// Everything that changes over the life of a session
struct SessionCore {
    state: SessionState,
    connection: ConnectionState,
    process: Option<ProcessSupervisor>,
    child: Option<ChildHandle>,
    relay: Option<Arc<ProtocolRelay>>,
    terminated_sent: bool,
}

struct SessionInner<C: Connect> {
    id: Uuid,
    config: SessionConfig,
    relay_config: RelayConfig,
    launch: Option<LaunchSpec>,
    connections: ConnectionManager<C>,
    outbound: Outbound,
    outbound_rx: Mutex<Option<OutboundRx>>,
    shutdown_tx: watch::Sender<bool>,
    state_tx: watch::Sender<SessionState>,
    core: Mutex<SessionCore>,
}

/// Debug session relaying between a front end and the runtime's debugger.
///
/// Cheap to clone; clones share the same session.
pub struct DebugSession<C: Connect = TcpConnector> {
    inner: Arc<SessionInner<C>>,
}

impl<C: Connect> Clone for DebugSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl DebugSession<TcpConnector> {
    /// Session over TCP with the given tuning
    pub fn new(config: SessionConfig, relay_config: RelayConfig) -> Self {
        SessionBuilder::new(config).relay_config(relay_config).build()
    }
}

impl<C: Connect> DebugSession<C> {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.core.lock().state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.core.lock().connection
    }

    /// The runtime process, once spawned
    pub fn child(&self) -> Option<ChildHandle> {
        self.inner.core.lock().child.clone()
    }

    /// Take the stream of messages bound for the front end. Only the first
    /// caller gets it; [`DebugSession::start`] takes it itself.
    pub fn take_outbound(&self) -> Option<OutboundRx> {
        self.inner.outbound_rx.lock().take()
    }

    /// Resolves once the session has fully terminated
    pub async fn terminated(&self) {
        let mut state_rx = self.inner.state_tx.subscribe();
        while *state_rx.borrow_and_update() != SessionState::Terminated {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Serve the front end over a byte stream pair until the session ends.
    ///
    /// Requests reach the remote in the order the front end sent them, while
    /// their answers are awaited concurrently. Everything bound for the front
    /// end is written in the order it was produced.
    pub async fn start<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let mut outbound_rx = self
            .take_outbound()
            .ok_or_else(|| Error::Other("Session already started".to_string()))?;

        tracing::info!("Serving debug session {}", self.inner.id);

        let session = self.clone();
        let mut reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(Frame::Message(Message::Request(request)))) => {
                        session.accept(request).await;
                    }
                    Ok(Some(Frame::Message(other))) => {
                        tracing::debug!("Ignoring {} from front end", other.kind());
                    }
                    Ok(Some(Frame::Malformed(e))) => {
                        tracing::warn!("Dropping message from front end: {}", e);
                    }
                    Ok(None) => {
                        tracing::info!("Front end closed its stream");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Error reading from front end: {}", e);
                        break;
                    }
                }
            }
        });
        let mut reader_done = false;

        let result = loop {
            tokio::select! {
                biased;
                message = outbound_rx.recv() => {
                    let Some(message) = message else { break Ok(()) };
                    if let Err(e) = write_message(&mut writer, &message).await {
                        tracing::warn!("Front end unreachable: {}", e);
                        self.shutdown().await;
                        break Err(e);
                    }
                }
                _ = self.terminated() => {
                    let mut drained = Ok(());
                    while let Ok(message) = outbound_rx.try_recv() {
                        if let Err(e) = write_message(&mut writer, &message).await {
                            drained = Err(e);
                            break;
                        }
                    }
                    break drained;
                }
                _ = &mut reader_task, if !reader_done => {
                    reader_done = true;
                    self.shutdown().await;
                }
            }
        };

        reader_task.abort();
        result
    }

    /// Handle one request from the front end, including waiting for the
    /// remote's answer when it is forwarded
    pub async fn handle_request(&self, request: Request) {
        if let Some(answer) = self.accept(request).await {
            let _ = answer.await;
        }
    }

    /// Take one request in arrival order. Anything bound for the remote has
    /// been written when this returns; waiting for the answer, and the whole
    /// initialize sequence, continue on the returned task.
    async fn accept(&self, request: Request) -> Option<JoinHandle<()>> {
        let policy = dispatch::policy_for(&request.command);
        tracing::debug!(
            "Front end request '{}' (seq {}): {:?}",
            request.command,
            request.seq,
            policy
        );

        match policy {
            Policy::Handshake => {
                let session = self.clone();
                Some(tokio::spawn(async move { session.initialize(request).await }))
            }
            Policy::Forward => self.forward(request).await,
            Policy::ForwardThenShutdown => {
                self.disconnect(request).await;
                None
            }
            Policy::LocalAck => {
                self.inner.outbound.send_response(Response::success(&request));
                None
            }
            Policy::Unsupported => {
                let message = format!("unrecognized request '{}'", request.command);
                self.inner.outbound.send_response(Response::error(&request, message));
                None
            }
        }
    }

    /// Tear everything down. Safe to call repeatedly and from any trigger.
    pub async fn shutdown(&self) {
        let (process, relay) = {
            let mut core = self.inner.core.lock();
            if core.state.is_closing() {
                return;
            }
            self.set_state(&mut core, SessionState::ShuttingDown);
            (core.process.take(), core.relay.take())
        };

        tracing::info!("Shutting down debug session {}", self.inner.id);
        self.inner.shutdown_tx.send_replace(true);

        if let Some(mut process) = process {
            if process.kill() {
                tracing::debug!("Sent kill to runtime");
            }
        }
        if let Some(relay) = relay {
            relay.dispose().await;
        }

        let mut core = self.inner.core.lock();
        core.connection = ConnectionState::Disconnected;
        self.set_state(&mut core, SessionState::Terminated);
        tracing::info!("Debug session {} terminated", self.inner.id);
    }

    async fn initialize(&self, request: Request) {
        if !self.transition(SessionState::Uninitialized, SessionState::Initializing) {
            tracing::warn!("Ignoring repeated initialize in state {:?}", self.state());
            self.inner
                .outbound
                .send_response(Response::error(&request, "session already initialized"));
            return;
        }

        let launch = match self.launch_spec() {
            Ok(launch) => launch,
            Err(e) => return self.fail_initialize(&request, e).await,
        };
        let (process, exit_rx) = match ProcessSupervisor::spawn(&launch, self.inner.outbound.clone()) {
            Ok(spawned) => spawned,
            Err(e) => return self.fail_initialize(&request, e).await,
        };

        let child = process.handle();
        let raced = {
            let mut core = self.inner.core.lock();
            if core.state == SessionState::Initializing {
                core.process = Some(process);
                core.child = Some(child.clone());
                core.connection = ConnectionState::Connecting;
                None
            } else {
                Some(process)
            }
        };
        if let Some(mut process) = raced {
            tracing::debug!("Session closed while spawning, killing runtime");
            process.kill();
            return;
        }
        self.watch_process(exit_rx);

        let config = &self.inner.config;
        let stream = match self
            .inner
            .connections
            .connect_with_retry(
                &config.host,
                config.port(),
                || !child.has_exited(),
                self.inner.shutdown_tx.subscribe(),
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.set_connection(ConnectionState::Failed);
                match e {
                    // The exit watcher ends the session, and may have won the race
                    Error::ChildExited | Error::ShutDown if child.has_exited() => self
                        .inner
                        .outbound
                        .send_response(Response::error(&request, Error::ChildExited.to_string())),
                    Error::ShutDown => {}
                    e => self.fail_initialize(&request, e).await,
                }
                return;
            }
        };

        let relay = ProtocolRelay::start(stream, self.inner.outbound.clone());
        let installed = {
            let mut core = self.inner.core.lock();
            if core.state == SessionState::Initializing {
                core.connection = ConnectionState::Connected;
                core.relay = Some(relay.clone());
                self.set_state(&mut core, SessionState::HandshakeWait);
                true
            } else {
                false
            }
        };
        if !installed {
            relay.dispose().await;
            return;
        }
        self.watch_relay(relay.clone());

        // The remote negotiates against the real client capabilities
        let response = match relay
            .send_request(
                &request.command,
                request.arguments.clone(),
                self.inner.relay_config.request_timeout(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Remote handshake did not complete: {}", e);
                return;
            }
        };

        let success = response.success;
        self.deliver(&request, response);
        if !success {
            tracing::warn!("Remote rejected initialize, ending session");
            self.emit_terminated_once();
            self.shutdown().await;
            return;
        }

        if self.transition(SessionState::HandshakeWait, SessionState::Active) {
            self.inner.outbound.send_event(Event::initialized());
            tracing::info!("Debug session {} active", self.inner.id);
        }
    }

    async fn forward(&self, request: Request) -> Option<JoinHandle<()>> {
        let relay = self.inner.core.lock().relay.clone();
        let Some(relay) = relay else {
            tracing::warn!(
                "No connection to the debugger, '{}' (seq {}) left unanswered",
                request.command,
                request.seq
            );
            return None;
        };

        let timeout = self.inner.relay_config.request_timeout();
        // A remote that stops reading must not stall the requests behind this one
        let submitted = tokio::time::timeout(
            timeout,
            relay.submit(&request.command, request.arguments.clone()),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(request.command.clone())));
        let pending = match submitted {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("Forwarding '{}' failed: {}", request.command, e);
                return None;
            }
        };

        let session = self.clone();
        Some(tokio::spawn(async move {
            match pending.wait(timeout).await {
                Ok(response) => session.deliver(&request, response),
                Err(e) => tracing::warn!("Forwarding '{}' failed: {}", request.command, e),
            }
        }))
    }

    async fn disconnect(&self, request: Request) {
        let relay = self.inner.core.lock().relay.clone();
        if let Some(relay) = relay {
            if let Err(e) = relay
                .send_detached(
                    &request.command,
                    request.arguments.clone(),
                    self.inner.relay_config.disconnect_timeout(),
                )
                .await
            {
                tracing::debug!("Best-effort disconnect to remote failed: {}", e);
            }
        }

        self.inner.outbound.send_response(Response::success(&request));
        self.shutdown().await;
    }

    /// Hand a remote response to the front end as the answer to `request`
    fn deliver(&self, request: &Request, mut response: Response) {
        response.seq = 0;
        response.request_seq = request.seq;
        self.inner.outbound.send_forwarded(response);
    }

    async fn fail_initialize(&self, request: &Request, error: Error) {
        tracing::error!("Failed to start debug session: {}", error);
        self.inner
            .outbound
            .send_response(Response::error(request, error.to_string()));
        self.emit_terminated_once();
        self.shutdown().await;
    }

    fn launch_spec(&self) -> Result<LaunchSpec> {
        match &self.inner.launch {
            Some(launch) => Ok(launch.clone()),
            None => {
                let config = self.inner.config.validate()?;
                Ok(LaunchSpec::gradle(&config, &self.inner.relay_config))
            }
        }
    }

    fn watch_process(&self, exit_rx: oneshot::Receiver<ProcessExit>) {
        let session = self.clone();
        tokio::spawn(async move {
            if let Ok(exit) = exit_rx.await {
                session.on_process_exit(exit).await;
            }
        });
    }

    fn watch_relay(&self, relay: Arc<ProtocolRelay>) {
        let session = self.clone();
        tokio::spawn(async move {
            relay.closed().await;
            session.on_relay_closed().await;
        });
    }

    async fn on_relay_closed(&self) {
        if self.state().is_closing() {
            return;
        }
        tracing::warn!("Lost connection to the debugger, forwarded requests will go unanswered");
        self.set_connection(ConnectionState::Disconnected);

        let runtime_gone = self
            .child()
            .map_or(true, |child| child.has_exited());
        if runtime_gone {
            self.emit_terminated_once();
            self.shutdown().await;
        }
    }

    async fn on_process_exit(&self, exit: ProcessExit) {
        if self.state().is_closing() {
            return;
        }
        tracing::warn!("Runtime exited unexpectedly (code {:?})", exit.code);
        self.emit_terminated_once();
        self.shutdown().await;
    }

    fn emit_terminated_once(&self) {
        let mut core = self.inner.core.lock();
        if !core.terminated_sent {
            core.terminated_sent = true;
            self.inner.outbound.send_event(Event::terminated());
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut core = self.inner.core.lock();
        if core.state != from {
            return false;
        }
        self.set_state(&mut core, to);
        true
    }

    fn set_state(&self, core: &mut SessionCore, state: SessionState) {
        tracing::debug!("Session state {:?} -> {:?}", core.state, state);
        core.state = state;
        self.inner.state_tx.send_replace(state);
    }

    fn set_connection(&self, connection: ConnectionState) {
        let mut core = self.inner.core.lock();
        // Shutdown owns the final value
        if !core.state.is_closing() {
            core.connection = connection;
        }
    }
}
