//! Realtime connection manager — the single duplex session to the remote
//! voice API.
//!
//! ## Shape
//!
//! ```text
//! RealtimeHandle ──send()──► OutboundQueue ──► network worker ──► WebSocket
//!        ▲                                          │
//!        └── register_handler(kind, fn) ◄──dispatch─┘  (inbound events)
//! ```
//!
//! One worker owns the socket. Producers (capture loop, nodes) talk to it
//! through a bounded drop-oldest-audio queue and never block. Inbound events
//! are dispatched to registered handlers in registration order, to
//! completion, before the next event — handlers stay short and queue any
//! long work.
//!
//! The worker reconnects forever with capped exponential backoff, re-sends
//! the last `session.update` after every reconnect, and tears the socket
//! down after a configurable idle period; the next queued directive brings
//! it back.

pub mod protocol;
pub mod session;

use std::collections::{HashMap, VecDeque};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{BanterError, Result};
use self::protocol::{ClientEvent, EventKind, ServerEvent, SessionConfig};
use self::session::{reconnect_delay, LinkState, SessionFlags};

/// Configuration for the realtime link.
#[derive(Clone)]
pub struct RealtimeConfig {
    /// WebSocket endpoint, without the model query parameter.
    pub url: String,
    /// Bearer credential for the remote API. Required.
    pub api_key: String,
    /// Model identifier appended as a query parameter.
    pub model: String,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_cap: Duration,
    /// Tear the socket down after this much inactivity. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Soft timeout for a single socket send.
    pub send_timeout: Duration,
    /// Outbound queue depth.
    pub outbound_depth: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".into(),
            api_key: String::new(),
            model: "gpt-4o-realtime-preview".into(),
            reconnect_initial: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(90)),
            send_timeout: Duration::from_secs(5),
            outbound_depth: 256,
        }
    }
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("reconnect_initial", &self.reconnect_initial)
            .field("reconnect_cap", &self.reconnect_cap)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// Bounded directive queue between producers and the network worker.
///
/// When full, the oldest **audio append** is shed first — a stale frame is
/// worthless, a control directive is not. Control events are evicted only
/// when the queue is all control, which indicates a stuck link anyway.
pub struct OutboundQueue {
    queue: Mutex<VecDeque<ClientEvent>>,
    notify: Notify,
    capacity: usize,
    dropped_audio: AtomicU64,
    dropped_control: AtomicU64,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped_audio: AtomicU64::new(0),
            dropped_control: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, event: ClientEvent) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                let audio_idx = queue.iter().position(ClientEvent::is_audio_append);
                match audio_idx {
                    Some(idx) => {
                        queue.remove(idx);
                        let n = self.dropped_audio.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(dropped = n, "outbound congested: shed oldest audio frame");
                    }
                    None => {
                        queue.pop_front();
                        let n = self.dropped_control.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(dropped = n, "outbound congested: shed oldest control event");
                    }
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    pub async fn recv(&self) -> Option<ClientEvent> {
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<ClientEvent> {
        self.queue.lock().pop_front()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Drop everything still queued (used on shutdown).
    pub fn discard_pending(&self) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn dropped_audio(&self) -> u64 {
        self.dropped_audio.load(Ordering::Relaxed)
    }

    pub fn dropped_control(&self) -> u64 {
        self.dropped_control.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

type Handler = Box<dyn FnMut(&ServerEvent) + Send>;

/// Token returned by [`RealtimeHandle::register_handler`]; pass it back to
/// deregister when the owning node stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    kind: EventKind,
    id: u64,
}

#[derive(Default)]
struct HandlerRegistry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable producer-side handle to the realtime link.
#[derive(Clone)]
pub struct RealtimeHandle {
    outbound: Arc<OutboundQueue>,
    flags: SessionFlags,
    registry: Arc<Mutex<HandlerRegistry>>,
    last_session: Arc<Mutex<Option<SessionConfig>>>,
    suppressed_audio: Arc<AtomicU64>,
}

impl RealtimeHandle {
    fn new(outbound_depth: usize) -> Self {
        Self {
            outbound: Arc::new(OutboundQueue::new(outbound_depth)),
            flags: SessionFlags::new(),
            registry: Arc::new(Mutex::new(HandlerRegistry::default())),
            last_session: Arc::new(Mutex::new(None)),
            suppressed_audio: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A handle with no network worker behind it. Directives pile up in the
    /// queue for inspection — used by tests and dry runs.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(RealtimeConfig::default().outbound_depth)
    }

    pub fn flags(&self) -> &SessionFlags {
        &self.flags
    }

    pub fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }

    /// Fire-and-forget a control directive. A `session.update` is also
    /// remembered so it can be replayed after a reconnect.
    pub fn send(&self, event: ClientEvent) {
        if let ClientEvent::SessionUpdate { ref session } = event {
            *self.last_session.lock() = Some(session.clone());
        }
        self.flags.touch_activity();
        self.outbound.push(event);
    }

    /// Stream one audio frame. A no-op while the link is down — frames from
    /// a dead session are not worth reconnecting for.
    pub fn stream_audio(&self, samples: &[f32]) {
        if !self.flags.is_connected() {
            self.suppressed_audio.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.flags.touch_activity();
        self.outbound.push(ClientEvent::append_from_samples(samples));
    }

    /// Frames suppressed because the link was down.
    pub fn suppressed_audio(&self) -> u64 {
        self.suppressed_audio.load(Ordering::Relaxed)
    }

    pub fn last_session(&self) -> Option<SessionConfig> {
        self.last_session.lock().clone()
    }

    /// Register a handler for one event kind. Handlers for the same kind
    /// run in registration order.
    pub fn register_handler(
        &self,
        kind: EventKind,
        handler: impl FnMut(&ServerEvent) + Send + 'static,
    ) -> HandlerId {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        HandlerId { kind, id }
    }

    pub fn deregister_handler(&self, token: HandlerId) {
        let mut registry = self.registry.lock();
        if let Some(list) = registry.handlers.get_mut(&token.kind) {
            list.retain(|(id, _)| *id != token.id);
        }
    }

    /// Route one inbound event: lifecycle bookkeeping first, then the
    /// registered handlers, in order, to completion.
    pub fn dispatch(&self, event: &ServerEvent) {
        self.flags.touch_activity();

        match event {
            ServerEvent::ResponseCreated { response } => {
                debug!(response_id = response.id.as_str(), "response started");
                self.flags.mark_response_started();
            }
            ServerEvent::ResponseDone { response } => {
                debug!(response_id = response.id.as_str(), "response done");
                self.flags.clear_response("response.done");
            }
            ServerEvent::Error { error } => {
                error!(
                    code = error.code.as_deref().unwrap_or("unknown"),
                    message = error.message.as_str(),
                    "protocol error from remote"
                );
                self.flags.clear_response("error");
            }
            _ => {}
        }

        let kind = event.kind();
        let mut registry = self.registry.lock();
        if let Some(handlers) = registry.handlers.get_mut(&kind) {
            for (_, handler) in handlers.iter_mut() {
                handler(event);
            }
        }
    }

    /// Synthesize the local connection-closed notification so subscribers
    /// can reset per-item buffers; also clears the response flag.
    pub fn dispatch_connection_closed(&self) {
        self.flags.clear_response("disconnect");
        let mut registry = self.registry.lock();
        if let Some(handlers) = registry.handlers.get_mut(&EventKind::ConnectionClosed) {
            for (_, handler) in handlers.iter_mut() {
                handler(&ServerEvent::Other);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Why one socket session ended.
enum SessionEnd {
    Shutdown,
    IdleTimeout,
    Dropped,
}

/// Owns the network worker for the lifetime of the process.
pub struct RealtimeLink {
    handle: RealtimeHandle,
    worker: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for RealtimeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeLink").finish_non_exhaustive()
    }
}

impl RealtimeLink {
    /// Spawn the network worker. The link starts connecting immediately.
    pub fn spawn(config: RealtimeConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(BanterError::Realtime("api key is required".into()));
        }

        let handle = RealtimeHandle::new(config.outbound_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker_handle = handle.clone();
        let worker = tokio::spawn(async move {
            run_link(config, worker_handle, shutdown_rx).await;
        });

        Ok(Self {
            handle,
            worker,
            shutdown_tx,
        })
    }

    pub fn handle(&self) -> RealtimeHandle {
        self.handle.clone()
    }

    /// Stop the worker, waiting up to `deadline` for the network loop to
    /// wind down. Messages still awaiting send are dropped.
    pub async fn stop(self, deadline: Duration) {
        self.handle.flags().set_state(LinkState::Closing);
        let discarded = self.handle.outbound.discard_pending();
        if discarded > 0 {
            debug!(discarded, "dropped outbound events on shutdown");
        }
        let _ = self.shutdown_tx.send(true);
        self.handle.outbound.close();

        if tokio::time::timeout(deadline, self.worker).await.is_err() {
            warn!("network worker missed shutdown deadline — detaching");
        }
        self.handle.flags().set_state(LinkState::Disconnected);
    }
}

async fn run_link(config: RealtimeConfig, handle: RealtimeHandle, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        handle.flags().set_state(LinkState::Connecting);
        match connect(&config).await {
            Ok(socket) => {
                info!(model = config.model.as_str(), "realtime session connected");
                handle.flags().reset_reconnect_attempt();
                handle.flags().set_state(LinkState::Connected);
                handle.flags().touch_activity();

                let end = drive_socket(socket, &handle, &config, &mut shutdown).await;

                handle.flags().set_state(LinkState::Disconnected);
                handle.dispatch_connection_closed();

                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::IdleTimeout => {
                        info!("realtime session idle — closed until next directive");
                        // Reconnect lazily: wait for outbound demand.
                        tokio::select! {
                            _ = wait_for_demand(&handle.outbound) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                    SessionEnd::Dropped => {
                        if !backoff_pause(&config, &handle, &mut shutdown).await {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("realtime connect failed: {e}");
                handle.flags().set_state(LinkState::Disconnected);
                if !backoff_pause(&config, &handle, &mut shutdown).await {
                    break;
                }
            }
        }
    }
    handle.flags().set_state(LinkState::Disconnected);
    debug!("network worker finished");
}

/// Sleep out the backoff for the next attempt; false means shutdown fired.
async fn backoff_pause(
    config: &RealtimeConfig,
    handle: &RealtimeHandle,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let attempt = handle.flags().bump_reconnect_attempt();
    let base = reconnect_delay(attempt, config.reconnect_initial, config.reconnect_cap);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    let delay = base + jitter;
    info!(attempt, ?delay, "reconnect backoff");
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

async fn wait_for_demand(outbound: &Arc<OutboundQueue>) {
    // Poll cheaply; demand after idle teardown is rare and latency-tolerant.
    while outbound.is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(config: &RealtimeConfig) -> Result<WsStream> {
    let url = format!("{}?model={}", config.url, config.model);
    let mut request = url
        .into_client_request()
        .map_err(|e| BanterError::Realtime(format!("bad endpoint url: {e}")))?;

    let auth = format!("Bearer {}", config.api_key)
        .parse()
        .map_err(|_| BanterError::Realtime("api key is not a valid header value".into()))?;
    request.headers_mut().insert("Authorization", auth);
    request.headers_mut().insert(
        "OpenAI-Beta",
        "realtime=v1"
            .parse()
            .map_err(|_| BanterError::Realtime("bad beta header".into()))?,
    );

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| BanterError::Realtime(format!("connect: {e}")))?;
    Ok(socket)
}

async fn drive_socket(
    socket: WsStream,
    handle: &RealtimeHandle,
    config: &RealtimeConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    // Restore the session configuration so tools/instructions survive
    // reconnects.
    if let Some(session) = handle.last_session() {
        let event = ClientEvent::SessionUpdate { session };
        if send_event(&mut sink, &event, config.send_timeout).await.is_err() {
            warn!("failed to restore session config after reconnect");
            return SessionEnd::Dropped;
        }
    }

    let idle_check = Duration::from_millis(500);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            maybe_event = handle.outbound.recv() => {
                let Some(event) = maybe_event else {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                };
                let is_audio = event.is_audio_append();
                if send_event(&mut sink, &event, config.send_timeout).await.is_err() {
                    if is_audio {
                        debug!("send timeout: audio frame dropped");
                    } else {
                        // Control directives get one retry before giving up
                        // the session.
                        warn!(event = event.name(), "send timeout: retrying control directive");
                        if send_event(&mut sink, &event, config.send_timeout).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => handle.dispatch(&event),
                            Err(e) => warn!("unparseable server event: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!("remote closed the realtime session");
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("socket error: {e}");
                        return SessionEnd::Dropped;
                    }
                }
            }

            _ = tokio::time::sleep(idle_check) => {
                if let Some(idle) = config.idle_timeout {
                    if handle.flags().idle_for() >= idle {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::IdleTimeout;
                    }
                }
            }
        }
    }
}

async fn send_event<S>(
    sink: &mut S,
    event: &ClientEvent,
    timeout: Duration,
) -> std::result::Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to serialize client event: {e}");
            return Err(());
        }
    };
    match tokio::time::timeout(timeout, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}
