//! Connection session worker.
//!
//! One task owns the session and is the only writer of its state. Caller
//! commands, connect-attempt progress and hardware events all arrive as
//! messages; the connect attempt itself runs in a child task so that
//! disconnects, superseding connects and hardware events are handled while
//! a handshake is still in flight.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PrinterConfig;
use crate::core::bluetooth::backend::{BackendEvent, BluetoothBackend};
use crate::core::bluetooth::channel::ChannelHandle;
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::directory::DeviceDirectory;
use crate::core::bluetooth::error::PrinterError;
use crate::core::bluetooth::pending::PendingResult;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{
    Capability, DeviceDescriptor, DeviceModel, PrinterEvent, SessionState,
};

pub(crate) type ConnectReply = PendingResult<Result<bool, PrinterError>>;

/// Requests from the caller-facing handle
pub(crate) enum Command {
    Connect {
        identifier: String,
        reply: ConnectReply,
    },
    Disconnect {
        reply: oneshot::Sender<bool>,
    },
    IsConnected {
        reply: oneshot::Sender<bool>,
    },
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), PrinterError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Reports from a running connect attempt
pub(crate) enum AttemptUpdate {
    Progress {
        id: u64,
        state: SessionState,
    },
    Finished {
        id: u64,
        outcome: Result<ChannelHandle, PrinterError>,
    },
}

struct Attempt {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The live connection session
struct ConnectionSession {
    id: u64,
    target: String,
    channel: Option<ChannelHandle>,
    pending: Option<ConnectReply>,
    attempt: Option<Attempt>,
}

/// Shared collaborators of the worker and its attempts
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub backend: Arc<dyn BluetoothBackend>,
    pub directory: DeviceDirectory,
    pub scanner: Arc<BluetoothScanner>,
    pub connector: ConnectionManager,
    pub config: PrinterConfig,
}

pub(crate) struct SessionWorker {
    context: SessionContext,
    events: broadcast::Sender<PrinterEvent>,
    state: watch::Sender<SessionState>,
    session: Option<ConnectionSession>,
    next_attempt_id: u64,
    /// Last capability reported by the backend, unknown until the first event
    capability: Option<Capability>,
    updates_tx: mpsc::UnboundedSender<AttemptUpdate>,
    updates_rx: mpsc::UnboundedReceiver<AttemptUpdate>,
}

impl SessionWorker {
    pub(crate) fn new(
        context: SessionContext,
        events: broadcast::Sender<PrinterEvent>,
        state: watch::Sender<SessionState>,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            context,
            events,
            state,
            session: None,
            next_attempt_id: 0,
            capability: None,
            updates_tx,
            updates_rx,
        }
    }

    /// Runs until shutdown or until every handle is dropped
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut backend_events = self.context.backend.events();
        let mut backend_open = true;
        info!("Session worker started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown("host shutdown").await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown("all handles dropped").await;
                        break;
                    }
                },
                Some(update) = self.updates_rx.recv() => self.handle_update(update).await,
                event = backend_events.recv(), if backend_open => match event {
                    Ok(event) => self.handle_backend_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} Bluetooth events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Bluetooth event stream closed");
                        backend_open = false;
                    }
                },
            }
        }

        info!("Session worker stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { identifier, reply } => self.start_connect(identifier, reply).await,
            Command::Disconnect { reply } => {
                let torn_down = self.teardown("disconnect requested").await;
                let _ = reply.send(torn_down);
            }
            Command::IsConnected { reply } => {
                let _ = reply.send(self.is_connected());
            }
            Command::Write { bytes, reply } => {
                let result = match self.open_channel() {
                    Some(channel) => channel.write(&bytes).await,
                    None => Err(PrinterError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                // Intercepted by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == SessionState::Open
            && self
                .session
                .as_ref()
                .and_then(|session| session.channel.as_ref())
                .is_some_and(ChannelHandle::is_live)
    }

    fn open_channel(&mut self) -> Option<&mut ChannelHandle> {
        self.session
            .as_mut()
            .and_then(|session| session.channel.as_mut())
    }

    fn set_state(&mut self, state: SessionState) {
        let previous = *self.state.borrow();
        if previous == state {
            return;
        }
        debug!("Session state: {:?} -> {:?}", previous, state);
        self.state.send_replace(state);
        let _ = self.events.send(PrinterEvent::StateChanged { state });
    }

    fn emit(&self, event: PrinterEvent) {
        info!("Emitting {:?}", event);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn is_current(&self, id: u64) -> bool {
        self.session.as_ref().is_some_and(|session| session.id == id)
    }

    async fn start_connect(&mut self, identifier: String, reply: ConnectReply) {
        if self.session.is_some() {
            self.teardown("superseded by a new connect").await;
        }

        self.next_attempt_id += 1;
        let id = self.next_attempt_id;
        let cancel = CancellationToken::new();

        let attempt = ConnectAttempt {
            id,
            identifier: identifier.clone(),
            context: self.context.clone(),
            cancel: cancel.clone(),
            updates: self.updates_tx.clone(),
        };

        info!("Starting connection attempt {} to {}", id, identifier);
        self.set_state(SessionState::Resolving);
        let handle = tokio::spawn(attempt.run());

        self.session = Some(ConnectionSession {
            id,
            target: identifier,
            channel: None,
            pending: Some(reply),
            attempt: Some(Attempt { cancel, handle }),
        });
    }

    async fn handle_update(&mut self, update: AttemptUpdate) {
        match update {
            AttemptUpdate::Progress { id, state } => {
                if self.is_current(id) {
                    self.set_state(state);
                }
            }
            AttemptUpdate::Finished { id, outcome } => {
                if !self.is_current(id) {
                    if let Ok(mut channel) = outcome {
                        warn!("Discarding channel from stale attempt {}", id);
                        channel.close().await;
                    }
                    return;
                }
                self.finish_attempt(outcome);
            }
        }
    }

    fn finish_attempt(&mut self, outcome: Result<ChannelHandle, PrinterError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.attempt = None;
        let pending = session.pending.take();

        match outcome {
            Ok(channel) => {
                info!("Connected to {}", channel.identifier());
                session.channel = Some(channel);
                self.set_state(SessionState::Open);
                if let Some(pending) = pending {
                    pending.complete(Ok(true));
                }
            }
            Err(e) => {
                error!("Connection to {} failed: {}", session.target, e);
                self.session = None;
                self.set_state(SessionState::Failed);
                if let Some(pending) = pending {
                    pending.complete(Err(e));
                }
                self.set_state(SessionState::Idle);
            }
        }
    }

    /// Common teardown for disconnect, supersede, capability loss and
    /// shutdown: stop the attempt, release the pending result, close the
    /// channel. Returns `false` if there was nothing to tear down.
    async fn teardown(&mut self, reason: &str) -> bool {
        let Some(mut session) = self.session.take() else {
            self.set_state(SessionState::Idle);
            return false;
        };

        info!("Closing session to {}: {}", session.target, reason);
        self.set_state(SessionState::Closing);

        if let Some(attempt) = session.attempt.take() {
            attempt.cancel.cancel();
            if let Err(e) = attempt.handle.await {
                error!("Connection attempt ended with a join error: {:?}", e);
            }
        }

        if let Some(pending) = session.pending.take() {
            if pending.release() {
                debug!("Released pending connect to {}", session.target);
            }
        }

        if let Some(mut channel) = session.channel.take() {
            channel.close().await;
        }

        self.set_state(SessionState::Idle);
        true
    }

    async fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::CapabilityChanged(capability) => {
                let previous = self.capability.replace(capability);
                if previous == Some(capability) {
                    return;
                }
                info!("Bluetooth is now {}", capability);

                if capability.is_ready() {
                    self.emit(PrinterEvent::BluetoothStateChanged {
                        state: "on".to_string(),
                    });
                    return;
                }

                let error = PrinterError::BluetoothUnavailable(capability);
                self.context.scanner.abort(error.clone()).await;

                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let was_open = session.channel.is_some();
                let target = session.target.clone();
                if let Some(pending) = session.pending.take() {
                    pending.complete(Err(error));
                }
                self.teardown("Bluetooth became unavailable").await;
                if was_open {
                    self.emit(PrinterEvent::Disconnected { address: target });
                }
            }
            BackendEvent::DeviceDisconnected(identifier) => {
                let open_target = self.session.as_ref().is_some_and(|session| {
                    session.target == identifier && session.channel.is_some()
                });
                if !open_target {
                    debug!("Ignoring disconnect of {}", identifier);
                    return;
                }

                warn!("Printer {} disconnected unexpectedly", identifier);
                if let Some(mut session) = self.session.take() {
                    if let Some(mut channel) = session.channel.take() {
                        channel.close().await;
                    }
                }
                self.set_state(SessionState::Idle);
                self.emit(PrinterEvent::Disconnected {
                    address: identifier,
                });
            }
        }
    }
}

/// One connect attempt: resolving, connecting, enumerating
struct ConnectAttempt {
    id: u64,
    identifier: String,
    context: SessionContext,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<AttemptUpdate>,
}

impl ConnectAttempt {
    async fn run(self) {
        let outcome = self.drive().await;
        if let Err(e) = &outcome {
            debug!("Attempt {} ended: {}", self.id, e);
        }

        let update = AttemptUpdate::Finished {
            id: self.id,
            outcome,
        };
        if let Err(mpsc::error::SendError(AttemptUpdate::Finished {
            outcome: Ok(mut channel),
            ..
        })) = self.updates.send(update)
        {
            channel.close().await;
        }
    }

    fn progress(&self, state: SessionState) {
        let _ = self.updates.send(AttemptUpdate::Progress { id: self.id, state });
    }

    async fn drive(&self) -> Result<ChannelHandle, PrinterError> {
        let device = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PrinterError::Cancelled),
            resolved = self.resolve() => resolved?,
        };

        self.progress(SessionState::Connecting);
        let mut link = self
            .context
            .connector
            .establish(&device, &self.cancel)
            .await?;

        if self.context.backend.model().requires_enumeration() {
            self.progress(SessionState::Enumerating);
            let timeout = self.context.config.enumeration_timeout();
            let bound = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(PrinterError::Cancelled),
                result = tokio::time::timeout(timeout, link.bind_channel()) => {
                    result.unwrap_or_else(|_| {
                        Err(PrinterError::ConnectionTimeout(format!(
                            "Service discovery on {} timed out after {:?}",
                            device.identifier, timeout
                        )))
                    })
                }
            };

            if let Err(e) = bound {
                if let Err(close_error) = link.close().await {
                    warn!("Error closing {} after failed enumeration: {}", device.identifier, close_error);
                }
                return Err(e);
            }
        }

        let mut channel = ChannelHandle::new(device.identifier, link);
        if self.cancel.is_cancelled() {
            channel.close().await;
            return Err(PrinterError::Cancelled);
        }
        Ok(channel)
    }

    async fn resolve(&self) -> Result<DeviceDescriptor, PrinterError> {
        let backend = &self.context.backend;
        let model = backend.model();

        let known = match self.context.directory.get(&self.identifier) {
            Some(device) => Some(device),
            None => {
                let resolved = backend.resolve(&self.identifier).await?;
                if let Some(device) = &resolved {
                    self.context.directory.insert(device.clone());
                }
                resolved
            }
        };

        let device = match known {
            Some(device) => device,
            None if model == DeviceModel::Broadcast => self
                .context
                .scanner
                .find(&self.identifier, self.context.config.lookup_scan_timeout())
                .await?
                .ok_or_else(|| PrinterError::DeviceNotFound(self.identifier.clone()))?,
            None => return Err(PrinterError::DeviceNotFound(self.identifier.clone())),
        };

        if model == DeviceModel::AddressBook && !device.paired {
            return Err(PrinterError::DeviceNotPaired(device.identifier));
        }

        debug!("Resolved {} to {:?}", self.identifier, device);
        Ok(device)
    }
}
