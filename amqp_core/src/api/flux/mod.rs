//! A continuous message stream sourced from a sequence of receive links.
//!
//! [`MessageFlux`] asks a [`ReceiveLinkSource`] for a link, emits its messages to one
//! [`Subscriber`] as demand allows, and once the link ends (completion or error) and its buffer
//! is drained, asks for the next link. The subscriber sees a single stream across link
//! recoveries until the flux terminates with an error, completes, or is cancelled.
//!
//! All emission happens in a serialized drain loop. Any task may signal the loop; the caller
//! that finds it idle runs it, and picks up signals raised while it was running before exiting.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{DeliveryState, DeliveryTag};

use self::mediator::{Mediator, MediatorEvent};

use super::{
    credit::CreditFlowMode,
    error::Error,
    message::Message,
    receiver::ReceiveLink,
    retry::RetryPolicy,
    Result,
};

mod mediator;

/// Delay before asking for a new link after one completed without error.
const COMPLETION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Provides the receive links a [`MessageFlux`] drains.
#[async_trait]
pub trait ReceiveLinkSource: Send + Sync + 'static {
    /// Next link to receive from, `None` once there will be no more links.
    async fn next_link(&self) -> Result<Option<Arc<dyn ReceiveLink>>>;
}

/// Downstream of a [`MessageFlux`].
///
/// Callbacks are serialized. `on_error` and `on_complete` are mutually exclusive and called
/// at most once; neither is called after the subscription is cancelled.
pub trait Subscriber: Send + Sync + 'static {
    /// An `Err` terminates the flux with a consumer error.
    fn on_next(&self, message: Message) -> Result<()>;

    fn on_error(&self, error: Error);

    fn on_complete(&self);
}

#[derive(Debug)]
enum Terminal {
    Complete,
    Error(Error),
}

#[derive(Default)]
struct MediatorHolder {
    current: Option<Arc<Mediator>>,
    /// No new mediator is accepted once frozen.
    frozen: bool,
}

struct FluxInner {
    source: Arc<dyn ReceiveLinkSource>,
    prefetch: u32,
    credit_mode: CreditFlowMode,
    retry_policy: Arc<dyn RetryPolicy>,
    runtime: Handle,
    subscriber: Mutex<Option<Arc<dyn Subscriber>>>,
    wip: AtomicUsize,
    requested: AtomicU64,
    cancelled: AtomicBool,
    terminal: Mutex<Option<Terminal>>,
    holder: Mutex<MediatorHolder>,
    retry_count: AtomicU32,
    cancel: CancellationToken,
}

/////////////////////////////////////////////////////////////////////////////
/// A message stream that survives the loss of individual links.
pub struct MessageFlux {
    inner: Arc<FluxInner>,
}

impl fmt::Debug for MessageFlux {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageFlux")
            .field("prefetch", &self.inner.prefetch)
            .field("credit_mode", &self.inner.credit_mode)
            .field("requested", &self.inner.requested.load(Ordering::Relaxed))
            .finish()
    }
}

impl MessageFlux {
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `prefetch` is 0 in emission-driven mode.
    pub fn new(
        source: Arc<dyn ReceiveLinkSource>,
        prefetch: u32,
        credit_mode: CreditFlowMode,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Self> {
        if prefetch == 0 && credit_mode == CreditFlowMode::EmissionDriven {
            return Err(Error::InvalidArgument(
                "prefetch must be greater than 0 for emission driven credit flow".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|err| {
            Error::IllegalState(format!("message flux requires a tokio runtime: {}", err))
        })?;
        Ok(Self {
            inner: Arc::new(FluxInner {
                source,
                prefetch,
                credit_mode,
                retry_policy,
                runtime,
                subscriber: Mutex::new(None),
                wip: AtomicUsize::new(0),
                requested: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                terminal: Mutex::new(None),
                holder: Mutex::new(MediatorHolder::default()),
                retry_count: AtomicU32::new(0),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Subscribes the only downstream of this flux and starts acquiring the first link.
    ///
    /// No message is emitted before demand is signalled with [`FluxSubscription::request`].
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if the flux already has a subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> Result<FluxSubscription> {
        {
            let mut current = self.inner.subscriber.lock();
            if current.is_some() {
                return Err(Error::IllegalState(
                    "message flux allows a single subscriber".to_string(),
                ));
            }
            *current = Some(subscriber);
        }
        self.inner.runtime.spawn(self.inner.clone().acquire_link());
        Ok(FluxSubscription {
            inner: self.inner.clone(),
        })
    }

    /// Subscribes a channel-backed receiver that keeps `batch` messages requested.
    pub fn receiver(&self, batch: u64) -> Result<FluxReceiver> {
        if batch == 0 {
            return Err(Error::InvalidArgument(
                "receiver batch must be greater than 0".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(Arc::new(ChannelSubscriber {
            tx: Mutex::new(Some(tx)),
        }))?;
        subscription.request(batch);
        Ok(FluxReceiver { rx, subscription })
    }

    /// Settles `message` on the link it was received from.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if that link is no longer the active link of the flux.
    pub async fn update_disposition(&self, message: &Message, state: DeliveryState) -> Result<()> {
        let (link_name, tag) = match (message.link_name(), message.delivery_tag()) {
            (Some(link_name), Some(tag)) => (link_name, tag),
            _ => {
                return Err(Error::InvalidArgument(
                    "message was not received from a link".to_string(),
                ))
            }
        };
        self.update_disposition_by_tag(link_name, tag, state).await
    }

    pub async fn update_disposition_by_tag(
        &self,
        link_name: &str,
        tag: &DeliveryTag,
        state: DeliveryState,
    ) -> Result<()> {
        let link = {
            let holder = self.inner.holder.lock();
            match holder.current {
                Some(ref mediator)
                    if mediator.link_name() == link_name && mediator.is_active() =>
                {
                    Some(mediator.link().clone())
                }
                _ => None,
            }
        };
        match link {
            Some(link) => link.update_disposition(tag, state).await,
            None => Err(Error::IllegalState(format!(
                "cannot settle delivery {}, link {} is closed or was replaced",
                tag, link_name
            ))),
        }
    }

    /// `true` once the flux completed, failed or was cancelled.
    pub fn is_terminated(&self) -> bool {
        self.inner.holder.lock().frozen
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Demand and cancellation handle of a subscriber.
#[derive(Clone)]
pub struct FluxSubscription {
    inner: Arc<FluxInner>,
}

impl fmt::Debug for FluxSubscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FluxSubscription")
            .field("requested", &self.inner.requested.load(Ordering::Relaxed))
            .field("cancelled", &self.inner.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

impl FluxSubscription {
    /// Adds `n` to the demand. `u64::MAX` is unbounded demand.
    pub fn request(&self, n: u64) {
        if n == 0 {
            warn!("request of 0 messages ignored");
            return;
        }
        let _ = self
            .inner
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            });
        self.inner.drain();
    }

    /// Stops emission and closes the current link. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            debug!("message flux cancelled by subscriber");
        }
        self.inner.drain();
    }
}

impl FluxInner {
    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if self.terminate_if_needed() {
                // tombstone, the work-in-progress counter is never released
                return;
            }
            let subscriber = self.subscriber.lock().clone();
            let mediator = self.holder.lock().current.clone();

            if let (Some(subscriber), Some(mediator)) = (subscriber, mediator) {
                let requested = self.requested.load(Ordering::Acquire);
                let mut emitted = 0u64;
                let mut failed = false;
                while emitted < requested {
                    if self.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    let message = match mediator.poll() {
                        Some(message) => message,
                        None => break,
                    };
                    emitted += 1;
                    if let Err(err) = subscriber.on_next(message) {
                        error!("subscriber failed to handle message, cause: {}.", err);
                        let err = match err {
                            Error::ConsumerError(_) => err,
                            other => Error::ConsumerError(other.to_string()),
                        };
                        self.set_terminal(Terminal::Error(err));
                        failed = true;
                        break;
                    }
                }
                if emitted > 0 {
                    let _ = self.requested.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |current| {
                            if current == u64::MAX {
                                Some(current)
                            } else {
                                Some(current.saturating_sub(emitted))
                            }
                        },
                    );
                }
                if failed || self.cancelled.load(Ordering::Acquire) {
                    continue;
                }

                let retire = mediator.is_drained_and_done();
                mediator.update_credit(self.requested.load(Ordering::Acquire), emitted);

                if retire && mediator.begin_retire() && self.retire(&mediator) {
                    // retries exhausted
                    continue;
                }
            }

            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                break;
            }
            missed = remaining;
        }
    }

    /// Runs cleanup and propagates the terminal signal once. `true` if terminated.
    fn terminate_if_needed(&self) -> bool {
        let cancelled = self.cancelled.load(Ordering::Acquire);
        let terminal = if cancelled {
            None
        } else {
            match self.terminal.lock().take() {
                Some(terminal) => Some(terminal),
                None => return false,
            }
        };

        self.cancel.cancel();
        let mediator = {
            let mut holder = self.holder.lock();
            holder.frozen = true;
            holder.current.take()
        };
        if let Some(mediator) = mediator {
            mediator.dispose();
        }

        let subscriber = self.subscriber.lock().clone();
        match (terminal, subscriber) {
            (Some(Terminal::Complete), Some(subscriber)) => {
                info!("message flux completed");
                subscriber.on_complete();
            }
            (Some(Terminal::Error(err)), Some(subscriber)) => {
                error!("message flux terminated, cause: {}.", err);
                subscriber.on_error(err);
            }
            _ => info!("message flux cancelled"),
        }
        true
    }

    fn set_terminal(&self, terminal: Terminal) {
        let mut current = self.terminal.lock();
        if current.is_none() {
            *current = Some(terminal);
        }
    }

    /// Closes a drained and terminated mediator and schedules the next link.
    /// `true` if no more links will be requested.
    fn retire(self: &Arc<Self>, mediator: &Arc<Mediator>) -> bool {
        mediator.dispose();
        {
            let mut holder = self.holder.lock();
            if matches!(holder.current, Some(ref current) if Arc::ptr_eq(current, mediator)) {
                holder.current = None;
            }
        }
        match mediator.error() {
            None => {
                info!(
                    "link {} completed, requesting a new link in {:?}",
                    mediator.link_name(),
                    COMPLETION_RETRY_DELAY
                );
                self.schedule_next_link(COMPLETION_RETRY_DELAY);
                false
            }
            Some(err) => {
                let attempt = self.retry_count.fetch_add(1, Ordering::AcqRel);
                match self.retry_policy.calculate_retry_delay(&err, attempt) {
                    Some(delay) => {
                        warn!(
                            "link {} terminated, retry attempt {} after {:?}, cause: {}.",
                            mediator.link_name(),
                            attempt + 1,
                            delay,
                            err
                        );
                        self.schedule_next_link(delay);
                        false
                    }
                    None => {
                        self.set_terminal(Terminal::Error(err));
                        true
                    }
                }
            }
        }
    }

    fn schedule_next_link(self: &Arc<Self>, delay: Duration) {
        let this = self.clone();
        self.runtime.spawn(async move {
            let cancelled = tokio::select! {
                _ = this.cancel.cancelled() => true,
                _ = time::sleep(delay) => false,
            };
            if !cancelled {
                this.acquire_link().await;
            }
        });
    }

    async fn acquire_link(self: Arc<Self>) {
        let res = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = self.source.next_link() => res,
        };
        match res {
            Ok(Some(link)) => self.on_link(link),
            Ok(None) => {
                debug!("link source completed");
                self.set_terminal(Terminal::Complete);
                self.drain();
            }
            Err(err) => {
                let attempt = self.retry_count.fetch_add(1, Ordering::AcqRel);
                match self.retry_policy.calculate_retry_delay(&err, attempt) {
                    Some(delay) => {
                        warn!(
                            "failed to obtain a link, retry attempt {} after {:?}, cause: {}.",
                            attempt + 1,
                            delay,
                            err
                        );
                        self.schedule_next_link(delay);
                    }
                    None => {
                        self.set_terminal(Terminal::Error(err));
                        self.drain();
                    }
                }
            }
        }
    }

    fn on_link(self: &Arc<Self>, link: Arc<dyn ReceiveLink>) {
        let mediator = Mediator::new(
            link.clone(),
            self.prefetch,
            self.credit_mode,
            self.cancel.child_token(),
            self.runtime.clone(),
        );
        {
            let mut holder = self.holder.lock();
            if holder.frozen {
                drop(holder);
                debug!("flux terminated, closing new link {}", link.link_name());
                self.runtime.spawn(async move {
                    link.close().await;
                });
                return;
            }
            holder.current = Some(mediator.clone());
        }
        info!("message flux receives from link {}", link.link_name());

        let flux = Arc::downgrade(self);
        mediator.start(Arc::new(move |event| {
            if let Some(flux) = flux.upgrade() {
                if event == MediatorEvent::Active {
                    flux.retry_count.store(0, Ordering::Release);
                }
                flux.drain();
            }
        }));
        self.drain();
    }
}

/////////////////////////////////////////////////////////////////////////////
struct ChannelSubscriber {
    tx: Mutex<Option<mpsc::UnboundedSender<Result<Message>>>>,
}

impl Subscriber for ChannelSubscriber {
    fn on_next(&self, message: Message) -> Result<()> {
        match *self.tx.lock() {
            Some(ref tx) => tx
                .send(Ok(message))
                .map_err(|_| Error::ConsumerError("receiver was dropped".to_string())),
            None => Err(Error::ConsumerError("receiver is closed".to_string())),
        }
    }

    fn on_error(&self, error: Error) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    fn on_complete(&self) {
        self.tx.lock().take();
    }
}

/// Pull-style view of a [`MessageFlux`]. Dropping it cancels the flux.
pub struct FluxReceiver {
    rx: mpsc::UnboundedReceiver<Result<Message>>,
    subscription: FluxSubscription,
}

impl FluxReceiver {
    /// Next message, `None` once the flux completed. The terminal error is returned once.
    pub async fn recv(&mut self) -> Option<Result<Message>> {
        let next = self.rx.recv().await;
        if let Some(Ok(_)) = next {
            self.subscription.request(1);
        }
        next
    }

    pub fn subscription(&self) -> &FluxSubscription {
        &self.subscription
    }
}

impl Drop for FluxReceiver {
    fn drop(&mut self) {
        self.subscription.cancel();
    }
}
