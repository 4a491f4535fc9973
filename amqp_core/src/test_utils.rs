//! In-memory protocol engine and helpers for unit tests.
use std::{
    collections::HashMap,
    future, io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    api::{
        cbs::{AccessToken, TokenCredential},
        error::Error,
        receiver::ReceiveLink,
        Result,
    },
    engine::{
        DeliveryOutcome, DeliveryState, DeliveryTag, EndpointState, EndpointStates,
        EngineConnection, EngineLink, EngineReceiver, EngineSender, EngineSession,
        InboundDelivery, Reactor, ReactorProvider, RemoteError,
    },
    Message, MessageSerializer,
};

//////////////////////////////////////////////////////////////////
// construct a subscriber that prints formatted traces to stdout
pub fn setup_logging() {
    // global subscriber with log level according to RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn closed_state(error: Option<RemoteError>) -> EndpointState {
    match error {
        Some(err) => EndpointState::Errored(err),
        None => EndpointState::Closed,
    }
}

// moves the endpoint to `state` unless it already reached a terminal one
fn transition(states: &watch::Sender<EndpointState>, state: EndpointState) {
    states.send_if_modified(|current| {
        if current.is_terminal() {
            return false;
        }
        *current = state;
        true
    });
}

// the latest entry of `list` named `name`
fn latest<T>(list: &Mutex<Vec<Arc<T>>>, name: &str, name_of: fn(&T) -> &str) -> Option<Arc<T>> {
    list.lock().iter().rev().find(|t| name_of(t) == name).cloned()
}

/// Endpoint state and open/close bookkeeping of a mock link.
struct LinkEndpoint {
    name: String,
    states: watch::Sender<EndpointState>,
    open_count: AtomicUsize,
    close_count: AtomicUsize,
}

impl LinkEndpoint {
    fn new(name: &str) -> Self {
        let (states, _) = watch::channel(EndpointState::Uninitialized);
        Self {
            name: name.to_owned(),
            states,
            open_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
        }
    }

    fn open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
        if *self.states.borrow() == EndpointState::Uninitialized {
            self.states.send_replace(EndpointState::Active);
        }
    }

    fn close(&self, error: Option<RemoteError>) {
        self.close_count.fetch_add(1, Ordering::AcqRel);
        transition(&self.states, closed_state(error));
    }
}

//////////////////////////////////////////////////////////////////
#[derive(Debug, Clone)]
enum ReactorEvent {
    Fail(String),
    Stop,
}

/// Drives a [`MockReactor`] from a test.
#[derive(Clone)]
pub struct ReactorControl {
    events: Arc<watch::Sender<Option<ReactorEvent>>>,
}

impl ReactorControl {
    /// The next `process` call fails with a transport error.
    pub fn fail(&self, message: &str) {
        self.events
            .send_replace(Some(ReactorEvent::Fail(message.to_owned())));
    }

    pub fn stop_engine(&self) {
        self.events.send_replace(Some(ReactorEvent::Stop));
    }
}

/// Reactor that idles until a test fails or stops it.
pub struct MockReactor {
    events: watch::Receiver<Option<ReactorEvent>>,
    stopped: bool,
}

#[async_trait]
impl Reactor for MockReactor {
    async fn process(&mut self) -> io::Result<bool> {
        loop {
            if self.stopped {
                return Ok(false);
            }
            let event = self.events.borrow_and_update().clone();
            match event {
                Some(ReactorEvent::Fail(message)) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, message))
                }
                Some(ReactorEvent::Stop) => return Ok(false),
                None => {}
            }
            if self.events.changed().await.is_err() {
                future::pending::<()>().await;
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

#[derive(Default)]
struct ProviderState {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    controls: Mutex<Vec<ReactorControl>>,
    hold_sessions: Arc<AtomicBool>,
}

/// Hands out one [`MockReactor`] and [`MockConnection`] per created connection.
#[derive(Clone, Default)]
pub struct MockReactorProvider {
    state: Arc<ProviderState>,
}

impl MockReactorProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// The `index`th connection created, in creation order.
    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.state.connections.lock()[index].clone()
    }

    pub fn reactor_control(&self, index: usize) -> ReactorControl {
        self.state.controls.lock()[index].clone()
    }

    /// Sessions opened from now on stay uninitialized.
    pub fn hold_sessions(&self) {
        self.state.hold_sessions.store(true, Ordering::Release);
    }
}

impl ReactorProvider for MockReactorProvider {
    fn create_reactor(
        &self,
        connection_id: &str,
        hostname: &str,
        _port: u16,
        _max_frame_size: u32,
    ) -> io::Result<(Box<dyn Reactor>, Arc<dyn EngineConnection>)> {
        let (tx, rx) = watch::channel(None);
        let connection = MockConnection::new(
            connection_id,
            hostname,
            self.state.hold_sessions.clone(),
        );
        self.state.controls.lock().push(ReactorControl {
            events: Arc::new(tx),
        });
        self.state.connections.lock().push(connection.clone());
        let reactor = MockReactor {
            events: rx,
            stopped: false,
        };
        Ok((Box::new(reactor), connection))
    }
}

//////////////////////////////////////////////////////////////////
pub struct MockConnection {
    connection_id: String,
    hostname: String,
    states: watch::Sender<EndpointState>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    hold_sessions: Arc<AtomicBool>,
    close_count: AtomicUsize,
}

impl MockConnection {
    fn new(connection_id: &str, hostname: &str, hold_sessions: Arc<AtomicBool>) -> Arc<Self> {
        let (states, _) = watch::channel(EndpointState::Uninitialized);
        Arc::new(Self {
            connection_id: connection_id.to_owned(),
            hostname: hostname.to_owned(),
            states,
            sessions: Mutex::new(Vec::new()),
            hold_sessions,
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: EndpointState) {
        self.states.send_replace(state);
    }

    /// The latest session begun with `name`.
    ///
    /// # Panics
    ///
    /// If no such session was begun.
    pub fn mock_session(&self, name: &str) -> Arc<MockSession> {
        self.find_session(name)
            .unwrap_or_else(|| panic!("no session {} on {}", name, self.connection_id))
    }

    pub fn find_session(&self, name: &str) -> Option<Arc<MockSession>> {
        latest(&self.sessions, name, |s| s.name.as_str())
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.find_session(name).is_some()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }
}

impl EngineConnection for MockConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn endpoint_states(&self) -> EndpointStates {
        self.states.subscribe()
    }

    fn open(&self) {
        transition(&self.states, EndpointState::Active);
    }

    fn close(&self, error: Option<RemoteError>) {
        self.close_count.fetch_add(1, Ordering::AcqRel);
        transition(&self.states, closed_state(error));
    }

    fn session(&self, name: &str) -> Arc<dyn EngineSession> {
        let session = MockSession::new(name, self.hold_sessions.load(Ordering::Acquire));
        self.sessions.lock().push(session.clone());
        session
    }
}

//////////////////////////////////////////////////////////////////
pub struct MockSession {
    name: String,
    held: bool,
    states: watch::Sender<EndpointState>,
    senders: Mutex<Vec<Arc<MockSender>>>,
    receivers: Mutex<Vec<Arc<MockReceiver>>>,
    close_count: AtomicUsize,
}

impl MockSession {
    fn new(name: &str, held: bool) -> Arc<Self> {
        let (states, _) = watch::channel(EndpointState::Uninitialized);
        Arc::new(Self {
            name: name.to_owned(),
            held,
            states,
            senders: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: EndpointState) {
        self.states.send_replace(state);
    }

    pub fn sender_count(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn find_sender(&self, name: &str) -> Option<Arc<MockSender>> {
        latest(&self.senders, name, |s| s.endpoint.name.as_str())
    }

    pub fn find_receiver(&self, name: &str) -> Option<Arc<MockReceiver>> {
        latest(&self.receivers, name, |r| r.endpoint.name.as_str())
    }

    /// The latest sender attached with `name`.
    ///
    /// # Panics
    ///
    /// If no such sender was attached.
    pub fn mock_sender(&self, name: &str) -> Arc<MockSender> {
        self.find_sender(name)
            .unwrap_or_else(|| panic!("no sender {} on session {}", name, self.name))
    }

    /// The latest receiver attached with `name`.
    ///
    /// # Panics
    ///
    /// If no such receiver was attached.
    pub fn mock_receiver(&self, name: &str) -> Arc<MockReceiver> {
        self.find_receiver(name)
            .unwrap_or_else(|| panic!("no receiver {} on session {}", name, self.name))
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }
}

impl EngineSession for MockSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint_states(&self) -> EndpointStates {
        self.states.subscribe()
    }

    fn open(&self) {
        if !self.held {
            transition(&self.states, EndpointState::Active);
        }
    }

    fn close(&self, error: Option<RemoteError>) {
        self.close_count.fetch_add(1, Ordering::AcqRel);
        transition(&self.states, closed_state(error));
    }

    fn sender(&self, link_name: &str, _entity_path: &str) -> Arc<dyn EngineSender> {
        let sender = MockSender::new(link_name);
        self.senders.lock().push(sender.clone());
        sender
    }

    fn receiver(&self, link_name: &str, _entity_path: &str) -> Arc<dyn EngineReceiver> {
        let receiver = MockReceiver::new(link_name);
        self.receivers.lock().push(receiver.clone());
        receiver
    }
}

//////////////////////////////////////////////////////////////////
/// Sender link recording what is sent, settled by the test through [`MockSender::respond`].
pub struct MockSender {
    endpoint: LinkEndpoint,
    credit: watch::Sender<u32>,
    remote_max_message_size: Mutex<Option<u64>>,
    current: Mutex<Option<DeliveryTag>>,
    deliveries: Mutex<HashMap<DeliveryTag, (Bytes, u32)>>,
    sent_tx: mpsc::UnboundedSender<DeliveryTag>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DeliveryTag>>,
    outcomes_tx: mpsc::UnboundedSender<DeliveryOutcome>,
    outcomes_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryOutcome>>>,
    sent_count: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MockSender {
    pub fn new(name: &str) -> Arc<Self> {
        let (credit, _) = watch::channel(0);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            endpoint: LinkEndpoint::new(name),
            credit,
            remote_max_message_size: Mutex::new(None),
            current: Mutex::new(None),
            deliveries: Mutex::new(HashMap::new()),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
            outcomes_tx,
            outcomes_rx: Mutex::new(Some(outcomes_rx)),
            sent_count: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn set_state(&self, state: EndpointState) {
        self.endpoint.states.send_replace(state);
    }

    /// Replaces the credit granted by the peer.
    pub fn set_credit(&self, credit: u32) {
        self.credit.send_replace(credit);
    }

    pub fn credit_left(&self) -> u32 {
        *self.credit.borrow()
    }

    pub fn set_remote_max_message_size(&self, size: Option<u64>) {
        *self.remote_max_message_size.lock() = size;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    /// Waits for the next delivery put on the wire.
    pub async fn next_sent(&self) -> Option<DeliveryTag> {
        self.sent_rx.lock().await.recv().await
    }

    /// Settles `tag` as the peer would.
    pub fn respond(&self, tag: &DeliveryTag, state: DeliveryState) {
        self.outcomes_tx
            .send(DeliveryOutcome {
                tag: tag.clone(),
                state,
            })
            .ok();
    }

    pub fn payload(&self, tag: &DeliveryTag) -> Option<Bytes> {
        self.deliveries.lock().get(tag).map(|(bytes, _)| bytes.clone())
    }

    pub fn message_format(&self, tag: &DeliveryTag) -> Option<u32> {
        self.deliveries.lock().get(tag).map(|(_, format)| *format)
    }

    pub fn sent_count(&self) -> usize {
        self.sent_count.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> usize {
        self.endpoint.open_count.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.endpoint.close_count.load(Ordering::Acquire)
    }
}

impl EngineLink for MockSender {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn endpoint_states(&self) -> EndpointStates {
        self.endpoint.states.subscribe()
    }

    fn open(&self) {
        self.endpoint.open();
    }

    fn close(&self, error: Option<RemoteError>) {
        self.endpoint.close(error);
    }

    fn credit(&self) -> u32 {
        *self.credit.borrow()
    }
}

impl EngineSender for MockSender {
    fn remote_max_message_size(&self) -> Option<u64> {
        *self.remote_max_message_size.lock()
    }

    fn send(&self, tag: &DeliveryTag, bytes: &[u8], message_format: u32) -> io::Result<usize> {
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport is not writable",
            ));
        }
        self.deliveries.lock().insert(
            tag.clone(),
            (Bytes::copy_from_slice(bytes), message_format),
        );
        *self.current.lock() = Some(tag.clone());
        self.sent_count.fetch_add(1, Ordering::AcqRel);
        self.credit.send_modify(|credit| *credit = credit.saturating_sub(1));
        self.sent_tx.send(tag.clone()).ok();
        Ok(bytes.len())
    }

    fn advance(&self) -> bool {
        self.current.lock().take().is_some()
    }

    fn credit_updates(&self) -> watch::Receiver<u32> {
        self.credit.subscribe()
    }

    fn take_outcomes(&self) -> Option<mpsc::UnboundedReceiver<DeliveryOutcome>> {
        self.outcomes_rx.lock().take()
    }
}

//////////////////////////////////////////////////////////////////
/// Receiver link fed by the test through [`MockReceiver::deliver`].
pub struct MockReceiver {
    endpoint: LinkEndpoint,
    credit: AtomicUsize,
    flows: Mutex<Vec<u32>>,
    settled: Mutex<Vec<(DeliveryTag, DeliveryState)>>,
    deliveries_tx: Mutex<Option<mpsc::UnboundedSender<InboundDelivery>>>,
    deliveries_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundDelivery>>>,
}

impl MockReceiver {
    pub fn new(name: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            endpoint: LinkEndpoint::new(name),
            credit: AtomicUsize::new(0),
            flows: Mutex::new(Vec::new()),
            settled: Mutex::new(Vec::new()),
            deliveries_tx: Mutex::new(Some(tx)),
            deliveries_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn set_state(&self, state: EndpointState) {
        self.endpoint.states.send_replace(state);
    }

    /// Delivers `payload` under a fresh tag, regardless of credit.
    pub fn deliver(&self, payload: Bytes) -> DeliveryTag {
        let tag = DeliveryTag::generate();
        if let Some(tx) = self.deliveries_tx.lock().as_ref() {
            tx.send(InboundDelivery {
                tag: tag.clone(),
                payload,
            })
            .ok();
        }
        self.credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            })
            .ok();
        tag
    }

    /// The peer detaches the link, ending its delivery stream.
    pub fn detach(&self, error: Option<RemoteError>) {
        transition(&self.endpoint.states, closed_state(error));
        self.deliveries_tx.lock().take();
    }

    pub fn flows(&self) -> Vec<u32> {
        self.flows.lock().clone()
    }

    pub fn settled(&self) -> Vec<(DeliveryTag, DeliveryState)> {
        self.settled.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.endpoint.open_count.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.endpoint.close_count.load(Ordering::Acquire)
    }
}

impl EngineLink for MockReceiver {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn endpoint_states(&self) -> EndpointStates {
        self.endpoint.states.subscribe()
    }

    fn open(&self) {
        self.endpoint.open();
    }

    fn close(&self, error: Option<RemoteError>) {
        self.endpoint.close(error);
        self.deliveries_tx.lock().take();
    }

    fn credit(&self) -> u32 {
        self.credit.load(Ordering::Acquire) as u32
    }
}

impl EngineReceiver for MockReceiver {
    fn flow(&self, credits: u32) {
        self.flows.lock().push(credits);
        self.credit.fetch_add(credits as usize, Ordering::AcqRel);
    }

    fn take_deliveries(&self) -> Option<mpsc::UnboundedReceiver<InboundDelivery>> {
        self.deliveries_rx.lock().take()
    }

    fn settle(&self, tag: &DeliveryTag, state: &DeliveryState) {
        self.settled.lock().push((tag.clone(), state.clone()));
    }
}

//////////////////////////////////////////////////////////////////
/// [`ReceiveLink`] fed with already decoded messages.
pub struct MockReceiveLink {
    name: String,
    states: watch::Sender<EndpointState>,
    messages_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    credit_requests: Mutex<Vec<u32>>,
    fail_credit_requests: AtomicBool,
    settled: Mutex<Vec<(DeliveryTag, DeliveryState)>>,
    close_count: AtomicUsize,
}

impl MockReceiveLink {
    pub fn new(name: &str) -> Arc<Self> {
        let (states, _) = watch::channel(EndpointState::Uninitialized);
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_owned(),
            states,
            messages_tx: Mutex::new(Some(tx)),
            messages_rx: Mutex::new(Some(rx)),
            credit_requests: Mutex::new(Vec::new()),
            fail_credit_requests: AtomicBool::new(false),
            settled: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: EndpointState) {
        self.states.send_replace(state);
    }

    /// Receives `message` on the link under a fresh delivery tag.
    pub fn push(&self, mut message: Message) {
        message.set_delivery(DeliveryTag::generate(), &self.name);
        if let Some(tx) = self.messages_tx.lock().as_ref() {
            tx.send(message).ok();
        }
    }

    /// The link closes normally after the messages pushed so far.
    pub fn complete(&self) {
        transition(&self.states, EndpointState::Closed);
        self.messages_tx.lock().take();
    }

    pub fn fail(&self, error: RemoteError) {
        transition(&self.states, EndpointState::Errored(error));
        self.messages_tx.lock().take();
    }

    /// Credit grants that reached the link.
    pub fn credit_requests(&self) -> Vec<u32> {
        self.credit_requests.lock().clone()
    }

    pub fn fail_credit_requests(&self) {
        self.fail_credit_requests.store(true, Ordering::Release);
    }

    pub fn settled(&self) -> Vec<(DeliveryTag, DeliveryState)> {
        self.settled.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ReceiveLink for MockReceiveLink {
    fn link_name(&self) -> &str {
        &self.name
    }

    fn entity_path(&self) -> &str {
        "queue-1"
    }

    fn hostname(&self) -> &str {
        "ns.example.com"
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.messages_rx.lock().take()
    }

    fn endpoint_states(&self) -> EndpointStates {
        self.states.subscribe()
    }

    fn credits(&self) -> u32 {
        self.credit_requests.lock().iter().sum()
    }

    fn add_credits(&self, credits: u32) -> Result<()> {
        if self.fail_credit_requests.load(Ordering::Acquire) {
            return Err(Error::IllegalState(format!(
                "link {} is closing",
                self.name
            )));
        }
        self.credit_requests.lock().push(credits);
        Ok(())
    }

    async fn update_disposition(&self, tag: &DeliveryTag, state: DeliveryState) -> Result<()> {
        self.settled.lock().push((tag.clone(), state));
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::AcqRel);
        transition(&self.states, EndpointState::Closed);
        self.messages_tx.lock().take();
    }

    fn is_disposed(&self) -> bool {
        self.states.borrow().is_terminal()
    }
}

//////////////////////////////////////////////////////////////////
/// Encodes messages as JSON documents.
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn encode(&self, message: &Message) -> Result<Bytes> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|err| Error::InvalidArgument(format!("failed to encode message, cause: {}", err)))
    }

    fn decode(&self, payload: &[u8]) -> Result<Message> {
        serde_json::from_slice(payload)
            .map_err(|err| Error::InvalidArgument(format!("failed to decode message, cause: {}", err)))
    }

    fn encode_batch(&self, messages: &[Message]) -> Result<Bytes> {
        serde_json::to_vec(messages)
            .map(Bytes::from)
            .map_err(|err| Error::InvalidArgument(format!("failed to encode batch, cause: {}", err)))
    }
}

/// Hands out the same token, valid for an hour.
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_owned(),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticCredential {
    async fn get_token(&self, _scopes: &[String]) -> Result<AccessToken> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_on: SystemTime::now() + Duration::from_secs(3600),
        })
    }
}

//////////////////////////////////////////////////////////////////
/// Plays the `$cbs` node of one mock connection, answering every put-token
/// request with a fixed status code.
pub struct CbsResponder {
    requests: Arc<Mutex<Vec<Message>>>,
    task: JoinHandle<()>,
}

impl CbsResponder {
    pub fn start(provider: &MockReactorProvider, connection: usize, status: i64) -> Self {
        let connection = provider.connection(connection);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            let (sender, receiver) = loop {
                let links = connection.find_session("cbs-session").and_then(|session| {
                    Some((
                        session.find_sender("cbs:sender")?,
                        session.find_receiver("cbs:receiver")?,
                    ))
                });
                match links {
                    Some(links) => break links,
                    None => time::sleep(Duration::from_millis(5)).await,
                }
            };
            sender.set_credit(100);
            while let Some(tag) = sender.next_sent().await {
                let request = match sender
                    .payload(&tag)
                    .map(|payload| JsonSerializer.decode(&payload))
                {
                    Some(Ok(request)) => request,
                    _ => continue,
                };
                sender.respond(&tag, DeliveryState::Accepted);
                let mut response = Message::new("").with_property("status-code", status);
                response.correlation_id = request.message_id.clone();
                recorded.lock().push(request);
                if let Ok(payload) = JsonSerializer.encode(&response) {
                    receiver.deliver(payload);
                }
            }
        });
        Self { requests, task }
    }

    pub fn requests(&self) -> Vec<Message> {
        self.requests.lock().clone()
    }
}

impl Drop for CbsResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
