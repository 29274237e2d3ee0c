use crate::config::SocketConfig;
use crate::socket::error::{RequestError, Result};
use crate::socket::observer::{
    InboundRequestHandler, ObserverId, SocketStateObserver, status_message,
};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use bytes::Bytes;
use log::{debug, info, warn};
use sigcore::frame::{InboundFrame, decode_frame, encode_request, encode_response};
use sigcore::request::{ServerRequest, SocketRequest, SocketResponse};
use sigcore::socket::{
    AppLifecycle, ConnectionMachine, ConnectionState, LifecycleAction, OpenAction,
    RequestCorrelator,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type SuccessCallback = Box<dyn FnOnce(SocketResponse) + Send + 'static>;
pub type FailureCallback = Box<dyn FnOnce(RequestError) + Send + 'static>;

/// The two halves of a pending request's outcome. Consumed by whichever of
/// them fires.
pub(crate) struct Responder {
    on_success: SuccessCallback,
    on_failure: FailureCallback,
}

impl Responder {
    fn complete(self, response: SocketResponse) {
        if response.is_success() {
            (self.on_success)(response)
        } else {
            (self.on_failure)(RequestError::ServerError {
                status: response.status,
                message: response.message,
                body: response.body,
            })
        }
    }

    fn fail(self, error: RequestError) {
        (self.on_failure)(error)
    }
}

/// Resources of one open connection epoch.
struct Connection {
    epoch: u64,
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    machine: ConnectionMachine,
    correlator: RequestCorrelator<Responder>,
    connection: Option<Connection>,
    connect_task: Option<JoinHandle<()>>,
    keep_open_timer: Option<(std::time::Instant, JoinHandle<()>)>,
    observers: Vec<(ObserverId, Arc<dyn SocketStateObserver>)>,
    next_observer_id: u64,
    inbound_handler: Option<Arc<dyn InboundRequestHandler>>,
    shut_down: bool,
}

/// Work collected under the lock and carried out after it is released, so
/// callbacks and observers may call back into the manager.
#[derive(Default)]
struct Effects {
    failures: Vec<(Responder, RequestError)>,
    completions: Vec<(Responder, SocketResponse)>,
    abort: Vec<JoinHandle<()>>,
    disconnect: Option<Arc<dyn Transport>>,
}

/// State changes waiting for observer delivery, queued in the order they
/// were made under the state lock. Whoever finds the queue idle drains it,
/// so observers see changes one at a time and in order.
#[derive(Default)]
struct Notifications {
    queue: VecDeque<(ConnectionState, Vec<Arc<dyn SocketStateObserver>>)>,
    draining: bool,
}

/// Owns the single socket connection: lifecycle, request correlation,
/// timers and observer fan-out. Construct one per session and pass it to
/// whoever needs to make requests.
pub struct SocketManager {
    config: SocketConfig,
    factory: Arc<dyn TransportFactory>,
    runtime: Handle,
    inner: Mutex<Inner>,
    notifications: Mutex<Notifications>,
    state_tx: watch::Sender<ConnectionState>,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl SocketManager {
    /// Must be called from within a tokio runtime; background tasks are
    /// spawned onto it.
    pub fn new(config: SocketConfig, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Self::with_runtime(config, factory, Handle::current())
    }

    pub fn with_runtime(
        config: SocketConfig,
        factory: Arc<dyn TransportFactory>,
        runtime: Handle,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                machine: ConnectionMachine::new(config.background_keep_open),
                correlator: RequestCorrelator::new(),
                connection: None,
                connect_task: None,
                keep_open_timer: None,
                observers: Vec::new(),
                next_observer_id: 1,
                inbound_handler: None,
                shut_down: false,
            }),
            notifications: Mutex::new(Notifications::default()),
            config,
            factory,
            runtime,
            state_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().machine.state()
    }

    /// True exactly when the connection is open.
    pub fn can_make_requests(&self) -> bool {
        self.lock().machine.is_open()
    }

    pub fn lifecycle(&self) -> AppLifecycle {
        self.lock().machine.lifecycle()
    }

    pub fn pending_requests(&self) -> usize {
        self.lock().correlator.len()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn SocketStateObserver>) -> ObserverId {
        let mut inner = self.lock();
        let id = ObserverId(inner.next_observer_id);
        inner.next_observer_id += 1;
        inner.observers.push((id, observer));
        id
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(registered, _)| *registered != id);
        inner.observers.len() != before
    }

    pub fn set_inbound_handler(&self, handler: Option<Arc<dyn InboundRequestHandler>>) {
        self.lock().inbound_handler = handler;
    }

    /// Opens the socket unless it is already open or connecting. While
    /// backgrounded every call also pushes the keep-open deadline out to at
    /// least one window from now. Safe to call from any thread.
    pub fn request_open(self: &Arc<Self>) {
        let mut fx = Effects::default();
        {
            let mut inner = self.lock();
            if inner.shut_down {
                return;
            }
            match inner.machine.request_open(now()) {
                OpenAction::Connect { epoch } => {
                    info!(target: "Socket", "Opening socket (epoch {epoch})");
                    self.publish(&mut inner, ConnectionState::Connecting);
                    let manager = self.clone();
                    inner.connect_task =
                        Some(self.runtime.spawn(async move { manager.run_connect(epoch).await }));
                }
                OpenAction::KeepOpenUntil(deadline) => {
                    debug!(target: "Socket", "Background keep-open extended to {deadline:?}");
                }
                OpenAction::None => {}
            }
            self.sync_keep_open_timer(&mut inner, &mut fx);
        }
        self.run_effects(fx);
    }

    pub fn set_foreground(self: &Arc<Self>, foreground: bool) {
        let lifecycle = if foreground {
            AppLifecycle::Foreground
        } else {
            AppLifecycle::Background
        };
        let mut fx = Effects::default();
        {
            let mut inner = self.lock();
            match inner.machine.set_lifecycle(lifecycle, now()) {
                LifecycleAction::Close { epoch } => {
                    info!(target: "Socket", "Keep-open window already elapsed, closing epoch {epoch}");
                    self.teardown(&mut inner, &mut fx);
                }
                LifecycleAction::KeepOpenUntil(deadline) => {
                    debug!(target: "Socket", "Backgrounded, holding socket open until {deadline:?}");
                }
                LifecycleAction::CancelKeepOpen => {
                    debug!(target: "Socket", "Foregrounded, keep-open deadline cleared");
                }
                LifecycleAction::None => {}
            }
            self.sync_keep_open_timer(&mut inner, &mut fx);
        }
        self.run_effects(fx);
    }

    /// Closes the connection. Pending requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.lock();
            if let Some(epoch) = inner.machine.close() {
                info!(target: "Socket", "Closing socket (epoch {epoch})");
                self.teardown(&mut inner, &mut fx);
            }
        }
        self.run_effects(fx);
    }

    /// Explicit end of the manager's life: closes the socket, cancels timers
    /// and drops observers and the inbound handler. Later open requests are
    /// ignored.
    pub fn shutdown(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            if inner.machine.close().is_some() {
                self.teardown(&mut inner, &mut fx);
            }
            inner.observers.clear();
            inner.inbound_handler = None;
        }
        info!(target: "Socket", "Socket manager shut down");
        self.run_effects(fx);
    }

    /// Sends `request` and reports the outcome through exactly one of the two
    /// callbacks. Fails immediately with `NotConnected` unless the socket is
    /// open.
    pub fn make_request<S, F>(&self, request: SocketRequest, on_success: S, on_failure: F)
    where
        S: FnOnce(SocketResponse) + Send + 'static,
        F: FnOnce(RequestError) + Send + 'static,
    {
        let responder = Responder {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        };
        let mut fx = Effects::default();
        {
            let mut inner = self.lock();
            let now = now();
            for expired in inner.correlator.take_expired(now) {
                fx.failures.push((expired.responder, RequestError::Timeout));
            }

            let epoch = inner.machine.epoch();
            let open = inner.machine.is_open()
                && inner.connection.as_ref().is_some_and(|c| c.epoch == epoch);
            if !open {
                fx.failures.push((responder, RequestError::NotConnected));
            } else {
                let timeout = request.timeout.unwrap_or(self.config.request_timeout);
                let id = inner.correlator.register(&request, now, timeout, responder);
                let frame = encode_request(id, &request);
                debug!(target: "Socket", "--> {} {} (id {id})", request.verb, request.path);

                let queued = inner
                    .connection
                    .as_ref()
                    .is_some_and(|c| c.outbound.send(frame).is_ok());
                if !queued {
                    if let Some(pending) = inner.correlator.resolve(id) {
                        fx.failures
                            .push((pending.responder, RequestError::ConnectionClosed));
                    }
                }
            }
        }
        self.run_effects(fx);
    }

    /// Async form of [`Self::make_request`].
    pub async fn send_request(&self, request: SocketRequest) -> Result<SocketResponse> {
        let (tx, rx) = oneshot::channel();
        let failure_tx = Arc::new(Mutex::new(Some(tx)));
        let success_tx = failure_tx.clone();
        self.make_request(
            request,
            move |response| {
                if let Some(tx) = success_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(Ok(response));
                }
            },
            move |error| {
                if let Some(tx) = failure_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(Err(error));
                }
            },
        );
        rx.await.unwrap_or(Err(RequestError::ConnectionClosed))
    }

    pub(crate) fn is_current_epoch(&self, epoch: u64) -> bool {
        let inner = self.lock();
        inner.machine.is_open() && inner.machine.epoch() == epoch
    }

    /// Drives the given epoch to closed after a transport failure. Stale
    /// epochs are ignored.
    pub(crate) fn handle_closed(&self, epoch: u64, reason: &str) {
        let mut fx = Effects::default();
        {
            let mut inner = self.lock();
            if !inner.machine.mark_closed(epoch) {
                return;
            }
            warn!(target: "Socket", "Socket closed (epoch {epoch}): {reason}");
            self.teardown(&mut inner, &mut fx);
        }
        self.run_effects(fx);
    }

    // Called with the state lock held, which fixes the delivery order.
    fn publish(&self, inner: &mut Inner, state: ConnectionState) {
        self.state_tx.send_replace(state);
        let observers = inner.observers.iter().map(|(_, o)| o.clone()).collect();
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .push_back((state, observers));
    }

    fn deliver_notifications(&self) {
        {
            let mut pending = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
            if pending.draining {
                return;
            }
            pending.draining = true;
        }
        // A panicking observer must not wedge delivery for good.
        let _reset = scopeguard::guard_on_unwind((), |_| {
            self.notifications
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .draining = false;
        });
        loop {
            let next = {
                let mut pending = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
                match pending.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };
            let (state, observers) = next;
            for observer in &observers {
                observer.on_state_changed(state);
            }
        }
    }

    fn teardown(&self, inner: &mut Inner, fx: &mut Effects) {
        if let Some(conn) = inner.connection.take() {
            fx.abort.extend(conn.tasks);
            fx.disconnect = Some(conn.transport);
        }
        if let Some(task) = inner.connect_task.take() {
            fx.abort.push(task);
        }
        if let Some((_, timer)) = inner.keep_open_timer.take() {
            fx.abort.push(timer);
        }
        for pending in inner.correlator.drain() {
            fx.failures
                .push((pending.responder, RequestError::ConnectionClosed));
        }
        self.publish(inner, ConnectionState::Closed);
    }

    // Keeps exactly one timer armed for the machine's current deadline.
    fn sync_keep_open_timer(self: &Arc<Self>, inner: &mut Inner, fx: &mut Effects) {
        let wanted = inner.machine.keep_open_until();
        let armed = inner.keep_open_timer.as_ref().map(|(deadline, _)| *deadline);
        if wanted == armed {
            return;
        }
        if let Some((_, timer)) = inner.keep_open_timer.take() {
            fx.abort.push(timer);
        }
        if let Some(deadline) = wanted {
            let manager = self.clone();
            let timer = self.runtime.spawn(async move {
                tokio::time::sleep_until(Instant::from_std(deadline)).await;
                manager.keep_open_elapsed();
            });
            inner.keep_open_timer = Some((deadline, timer));
        }
    }

    fn keep_open_elapsed(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.lock();
            // This timer is finishing; do not abort it.
            inner.keep_open_timer = None;
            if let Some(epoch) = inner.machine.keep_open_expired(now()) {
                info!(target: "Socket", "Background keep-open window elapsed, closing epoch {epoch}");
                self.teardown(&mut inner, &mut fx);
            }
        }
        self.run_effects(fx);
    }

    fn run_effects(&self, fx: Effects) {
        for task in fx.abort {
            task.abort();
        }
        if let Some(transport) = fx.disconnect {
            self.runtime.spawn(async move { transport.disconnect().await });
        }
        self.deliver_notifications();
        for (responder, response) in fx.completions {
            responder.complete(response);
        }
        for (responder, error) in fx.failures {
            responder.fail(error);
        }
    }

    async fn run_connect(self: Arc<Self>, epoch: u64) {
        // Any exit other than a completed handshake (including this task being
        // aborted) closes the epoch.
        let guard = scopeguard::guard(self.clone(), move |manager| {
            manager.handle_closed(epoch, "connect attempt did not complete");
        });

        let deadline = Instant::now() + self.config.connect_timeout;
        let (transport, mut events) =
            match tokio::time::timeout_at(deadline, self.factory.create_transport()).await {
                Ok(Ok(created)) => created,
                Ok(Err(e)) => {
                    warn!(target: "Socket", "Failed to create transport: {e:?}");
                    return;
                }
                Err(_) => {
                    warn!(target: "Socket", "Connect timed out after {:?}", self.config.connect_timeout);
                    return;
                }
            };

        match tokio::time::timeout_at(deadline, wait_for_connected(&mut events)).await {
            Ok(true) => {
                let manager = scopeguard::ScopeGuard::into_inner(guard);
                manager.handle_connected(epoch, transport, events);
            }
            Ok(false) => {
                warn!(target: "Socket", "Transport closed before the connection was established");
                transport.disconnect().await;
            }
            Err(_) => {
                warn!(target: "Socket", "Connect timed out after {:?}", self.config.connect_timeout);
                transport.disconnect().await;
            }
        }
    }

    fn handle_connected(
        self: &Arc<Self>,
        epoch: u64,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) {
        let mut fx = Effects::default();
        {
            let mut inner = self.lock();
            // This task is finishing; do not abort it.
            inner.connect_task = None;
            if !inner.machine.mark_open(epoch, now()) {
                debug!(target: "Socket", "Dropping transport for stale epoch {epoch}");
                fx.disconnect = Some(transport);
            } else {
                info!(target: "Socket", "Socket open (epoch {epoch})");
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                let tasks = vec![
                    self.runtime
                        .spawn(self.clone().write_loop(epoch, transport.clone(), outbound_rx)),
                    self.runtime.spawn(self.clone().read_loop(epoch, events)),
                    self.runtime.spawn(self.clone().timeout_sweep_loop(epoch)),
                    self.runtime.spawn(self.clone().keepalive_loop(epoch)),
                ];
                inner.connection = Some(Connection {
                    epoch,
                    transport,
                    outbound,
                    tasks,
                });
                self.publish(&mut inner, ConnectionState::Open);
                self.sync_keep_open_timer(&mut inner, &mut fx);
            }
        }
        self.run_effects(fx);
    }

    // Frames are queued under the state lock and written by this task alone,
    // which keeps transmission in call order.
    async fn write_loop(
        self: Arc<Self>,
        epoch: u64,
        transport: Arc<dyn Transport>,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = transport.send_frame(&frame).await {
                self.handle_closed(epoch, &format!("send failed: {e}"));
                return;
            }
        }
    }

    async fn read_loop(self: Arc<Self>, epoch: u64, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Some(TransportEvent::FrameReceived(data)) => self.handle_frame(epoch, data),
                Some(TransportEvent::Connected) => {
                    debug!(target: "Socket", "Ignoring duplicate connected event");
                }
                Some(TransportEvent::Disconnected) | None => {
                    self.handle_closed(epoch, "transport disconnected");
                    return;
                }
            }
        }
    }

    async fn timeout_sweep_loop(self: Arc<Self>, epoch: u64) {
        loop {
            let wake = {
                let inner = self.lock();
                let next_tick = Instant::now() + self.config.timeout_sweep_interval;
                match inner.correlator.next_deadline() {
                    Some(deadline) => next_tick.min(Instant::from_std(deadline)),
                    None => next_tick,
                }
            };
            tokio::time::sleep_until(wake).await;

            let mut fx = Effects::default();
            {
                let mut inner = self.lock();
                if inner.machine.epoch() != epoch || !inner.machine.is_open() {
                    return;
                }
                for expired in inner.correlator.take_expired(now()) {
                    debug!(target: "Socket", "Request {} {} (id {}) timed out", expired.verb, expired.path, expired.id);
                    fx.failures.push((expired.responder, RequestError::Timeout));
                }
            }
            self.run_effects(fx);
        }
    }

    fn handle_frame(self: &Arc<Self>, epoch: u64, data: Bytes) {
        let frame = match decode_frame(&data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Socket", "Discarding undecodable frame: {e}");
                return;
            }
        };

        match frame {
            InboundFrame::Response(response) => {
                let mut fx = Effects::default();
                {
                    let mut inner = self.lock();
                    if inner.machine.epoch() != epoch {
                        return;
                    }
                    match inner.correlator.resolve(response.id) {
                        Some(pending) => {
                            debug!(
                                target: "Socket",
                                "<-- {} for {} {} (id {})",
                                response.status, pending.verb, pending.path, response.id
                            );
                            fx.completions.push((pending.responder, response));
                        }
                        None => {
                            debug!(target: "Socket", "Discarding response for unknown request id {}", response.id);
                        }
                    }
                }
                self.run_effects(fx);
            }
            InboundFrame::Request(request) => {
                let handler = self.lock().inbound_handler.clone();
                let manager = self.clone();
                self.runtime.spawn(async move {
                    manager.answer_server_request(epoch, request, handler).await;
                });
            }
        }
    }

    async fn answer_server_request(
        &self,
        epoch: u64,
        request: ServerRequest,
        handler: Option<Arc<dyn InboundRequestHandler>>,
    ) {
        let id = request.id;
        let status = match handler {
            Some(handler) => handler.handle_request(request).await,
            None => {
                debug!(target: "Socket", "No handler for server request {} {}", request.verb, request.path);
                404
            }
        };
        let frame = encode_response(id, status, status_message(status), None);

        let inner = self.lock();
        match inner.connection.as_ref() {
            Some(conn) if conn.epoch == epoch => {
                let _ = conn.outbound.send(frame);
            }
            _ => debug!(target: "Socket", "Connection gone before answering server request {id}"),
        }
    }
}

async fn wait_for_connected(events: &mut mpsc::Receiver<TransportEvent>) -> bool {
    loop {
        match events.recv().await {
            Some(TransportEvent::Connected) => return true,
            Some(TransportEvent::FrameReceived(_)) => {
                debug!(target: "Socket", "Dropping frame received before connect completed");
            }
            Some(TransportEvent::Disconnected) | None => return false,
        }
    }
}
