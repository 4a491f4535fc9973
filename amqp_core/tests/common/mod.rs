use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use amqp_core::{
    engine::{DeliveryState, DeliveryTag, EndpointState, EndpointStates, RemoteError},
    error::Error,
    flux::ReceiveLinkSource,
    receiver::ReceiveLink,
    AmqpRetryPolicy, Message, RetryMode, RetryOptions, RetryPolicy,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// construct a subscriber that prints formatted traces to stdout
pub fn setup_logging() {
    // global subscriber with log level according to RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

pub fn fixed_retry_policy(max_retries: u32) -> Arc<dyn RetryPolicy> {
    AmqpRetryPolicy::shared(
        RetryOptions::new()
            .mode(RetryMode::Fixed)
            .max_retries(max_retries)
            .delay(Duration::from_millis(200))
            .finish(),
    )
}

/// A receive link fed by the test.
pub struct ChannelLink {
    name: String,
    states: watch::Sender<EndpointState>,
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    credits: AtomicUsize,
    closes: AtomicUsize,
}

impl ChannelLink {
    pub fn new(name: &str) -> Arc<Self> {
        let (states, _) = watch::channel(EndpointState::Active);
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_owned(),
            states,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            credits: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn send(&self, body: &str) {
        if let Some(ref tx) = *self.tx.lock() {
            tx.send(Message::new(body.to_owned())).ok();
        }
    }

    /// Ends the link, with `error` if the peer detached it.
    pub fn end(&self, error: Option<RemoteError>) {
        self.states.send_replace(match error {
            Some(err) => EndpointState::Errored(err),
            None => EndpointState::Closed,
        });
        self.tx.lock().take();
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReceiveLink for ChannelLink {
    fn link_name(&self) -> &str {
        &self.name
    }

    fn entity_path(&self) -> &str {
        "orders"
    }

    fn hostname(&self) -> &str {
        "localhost"
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.rx.lock().take()
    }

    fn endpoint_states(&self) -> EndpointStates {
        self.states.subscribe()
    }

    fn credits(&self) -> u32 {
        self.credits.load(Ordering::SeqCst) as u32
    }

    fn add_credits(&self, credits: u32) -> Result<(), Error> {
        self.credits.fetch_add(credits as usize, Ordering::SeqCst);
        Ok(())
    }

    async fn update_disposition(&self, _tag: &DeliveryTag, _state: DeliveryState) -> Result<(), Error> {
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if !self.states.borrow().is_terminal() {
            self.end(None);
        }
    }

    fn is_disposed(&self) -> bool {
        self.states.borrow().is_terminal()
    }
}

/// Hands out queued outcomes, completes once the queue is empty.
pub struct QueueSource {
    queue: Mutex<VecDeque<Result<Arc<ChannelLink>, Error>>>,
    calls: AtomicUsize,
}

impl QueueSource {
    pub fn new(queue: Vec<Result<Arc<ChannelLink>, Error>>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(queue.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReceiveLinkSource for QueueSource {
    async fn next_link(&self) -> Result<Option<Arc<dyn ReceiveLink>>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().pop_front();
        match next {
            Some(Ok(link)) => Ok(Some(link)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}
