//! Reliable send path of a sender link.
//!
//! Every send is tracked by a work item until the broker settles it. Rejections caused by
//! transient conditions are redelivered with a new delivery tag, as long as the retry policy
//! allows it within the time left to the send.
use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::oneshot,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    engine::{
        DeliveryOutcome, DeliveryState, DeliveryTag, EndpointState, EndpointStates, EngineSender,
        ErrorCondition, RemoteError,
    },
    net::ReactorDispatcher,
};

use super::{
    error::{Error, ErrorContext},
    message::{Message, MessageSerializer, BATCH_MESSAGE_FORMAT, DEFAULT_MESSAGE_FORMAT, MAX_MESSAGE_LENGTH_BYTES},
    options::SendOptions,
    receiver::wait_for_active,
    retry::{with_retry, RetryPolicy, SERVER_BUSY_WAIT_TIME},
    token::{AuthorizationResult, TokenManager},
    Result,
};

/// Position of a delivery in the send queue.
#[derive(Debug, PartialEq, Eq)]
struct PendingSend {
    is_retry: bool,
    sequence: u64,
    tag: DeliveryTag,
}

impl Ord for PendingSend {
    // max-heap: never retried first, then lowest sequence
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .is_retry
            .cmp(&self.is_retry)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for PendingSend {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// An outstanding delivery.
struct WorkItem {
    sequence: u64,
    payload: Bytes,
    message_format: u32,
    retry_count: u32,
    deadline: Instant,
    awaiting_ack: bool,
    last_error: Option<Error>,
    responder: oneshot::Sender<Result<()>>,
    timer: CancellationToken,
}

impl WorkItem {
    fn complete(self, result: Result<()>) {
        self.timer.cancel();
        // the caller may have given up
        let _ = self.responder.send(result);
    }
}

#[derive(Default)]
struct SendState {
    pending: BinaryHeap<PendingSend>,
    /// One item per live delivery tag.
    work_items: HashMap<DeliveryTag, WorkItem>,
    /// Current tag of each live sequence, kept in step with `work_items`.
    tags: HashMap<u64, DeliveryTag>,
    last_link_error: Option<(Error, Instant)>,
}

impl SendState {
    fn insert(&mut self, tag: DeliveryTag, item: WorkItem) {
        self.tags.insert(item.sequence, tag.clone());
        self.work_items.insert(tag, item);
    }

    fn remove(&mut self, tag: &DeliveryTag) -> Option<WorkItem> {
        let item = self.work_items.remove(tag)?;
        self.tags.remove(&item.sequence);
        Some(item)
    }

    fn remove_sequence(&mut self, sequence: u64) -> Option<WorkItem> {
        let tag = self.tags.remove(&sequence)?;
        self.work_items.remove(&tag)
    }

    fn take_all(&mut self) -> Vec<WorkItem> {
        self.pending.clear();
        self.tags.clear();
        self.work_items.drain().map(|(_, item)| item).collect()
    }
}

struct SenderInner {
    link_name: String,
    entity_path: String,
    sender: Arc<dyn EngineSender>,
    dispatcher: ReactorDispatcher,
    serializer: Arc<dyn MessageSerializer>,
    retry_policy: Arc<dyn RetryPolicy>,
    token_manager: Option<Arc<TokenManager>>,
    options: SendOptions,
    context: ErrorContext,
    link_size: Mutex<Option<u64>>,
    state: Mutex<SendState>,
    sequence: AtomicU64,
    is_disposed: AtomicBool,
    is_closed: AtomicBool,
    cancel: CancellationToken,
}

/////////////////////////////////////////////////////////////////////////////
/// Sends messages on a sender link.
#[derive(Clone)]
pub struct ReactorSender {
    inner: Arc<SenderInner>,
}

impl ReactorSender {
    /// Wraps an engine sender that has been opened on the dispatcher.
    pub(crate) fn new(
        namespace: &str,
        entity_path: &str,
        sender: Arc<dyn EngineSender>,
        dispatcher: ReactorDispatcher,
        serializer: Arc<dyn MessageSerializer>,
        retry_policy: Arc<dyn RetryPolicy>,
        token_manager: Option<Arc<TokenManager>>,
        options: SendOptions,
    ) -> Result<Self> {
        let link_name = sender.name().to_owned();
        let outcomes = sender.take_outcomes().ok_or_else(|| {
            Error::IllegalState(format!("outcomes of link {} already taken", link_name))
        })?;
        let inner = Arc::new(SenderInner {
            context: ErrorContext::for_link(namespace, entity_path, &link_name),
            link_name,
            entity_path: entity_path.to_owned(),
            sender,
            dispatcher,
            serializer,
            retry_policy,
            token_manager,
            options,
            link_size: Mutex::new(None),
            state: Mutex::new(SendState::default()),
            sequence: AtomicU64::new(0),
            is_disposed: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(inner.clone().run_link_events(outcomes));
        if let Some(ref token_manager) = inner.token_manager {
            tokio::spawn(inner.clone().watch_authorization(token_manager.clone()));
        }
        Ok(Self { inner })
    }

    pub fn link_name(&self) -> &str {
        &self.inner.link_name
    }

    pub fn entity_path(&self) -> &str {
        &self.inner.entity_path
    }

    /// Sends `message`, resolving once the broker accepted it.
    ///
    /// # Errors
    ///
    /// Returns `PayloadSizeExceeded` if the encoded message does not fit into the link, or the
    /// error the delivery finally failed with.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let payload = self.inner.serializer.encode(message)?;
        self.send_payload(payload, DEFAULT_MESSAGE_FORMAT).await
    }

    /// Sends `messages` as one batched delivery.
    pub async fn send_batch(&self, messages: &[Message]) -> Result<()> {
        match messages.len() {
            0 => Err(Error::InvalidArgument("batch cannot be empty".to_string())),
            1 => self.send(&messages[0]).await,
            _ => {
                let payload = self.inner.serializer.encode_batch(messages)?;
                self.send_payload(payload, BATCH_MESSAGE_FORMAT).await
            }
        }
    }

    /// Max size of a message on this link, waiting for the link to become active.
    pub async fn get_link_size(&self) -> Result<u64> {
        if let Some(size) = *self.inner.link_size.lock() {
            return Ok(size);
        }
        let size = match self.inner.options.max_message_size {
            Some(size) => size,
            None => {
                with_retry(
                    self.inner.retry_policy.as_ref(),
                    &format!("wait for link {} to be active", self.inner.link_name),
                    || self.wait_for_active(),
                )
                .await?;
                match self.inner.sender.remote_max_message_size() {
                    Some(size) if size > 0 => size,
                    _ => MAX_MESSAGE_LENGTH_BYTES,
                }
            }
        };
        *self.inner.link_size.lock() = Some(size);
        Ok(size)
    }

    pub(crate) async fn wait_for_active(&self) -> Result<()> {
        wait_for_active(self.inner.sender.endpoint_states(), &self.inner.context).await
    }

    pub(crate) fn endpoint_states(&self) -> EndpointStates {
        self.inner.sender.endpoint_states()
    }

    pub(crate) fn context(&self) -> &ErrorContext {
        &self.inner.context
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Closes the link, failing outstanding sends. Idempotent.
    pub fn close(&self) {
        if self.inner.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.is_disposed.store(true, Ordering::Release);
        info!("close link {} of {}", self.inner.link_name, self.inner.entity_path);
        self.inner.cancel.cancel();
        let sender = self.inner.sender.clone();
        if let Err(err) = self.inner.dispatcher.invoke(move || sender.close(None)) {
            debug!(
                "link {} closed with its connection, cause: {}.",
                self.inner.link_name, err
            );
        }
        self.inner.fail_all(Error::OperationCancelled(format!(
            "sender link closed, {}",
            self.inner.context
        )));
        if let Some(ref token_manager) = self.inner.token_manager {
            token_manager.close();
        }
    }

    async fn send_payload(&self, payload: Bytes, message_format: u32) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::IllegalState(format!(
                "cannot send, link is closed, {}",
                self.inner.context
            )));
        }
        let link_size = self.get_link_size().await?;
        let size = payload.len() as u64;
        if size > link_size {
            return Err(Error::PayloadSizeExceeded(format!(
                "size of the payload ({} bytes) exceeds the link size ({} bytes), {}",
                size, link_size, self.inner.context
            )));
        }

        let (tx, rx) = oneshot::channel();
        let sequence = self.inner.enqueue(payload, message_format, tx);
        let inner = self.inner.clone();
        if let Err(err) = self.inner.dispatcher.invoke(move || inner.process_send_work()) {
            self.inner.abandon(sequence);
            return Err(err.into());
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::IllegalState(format!(
                "send abandoned, {}",
                self.inner.context
            ))),
        }
    }
}

impl SenderInner {
    fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::Acquire)
            || self.sender.endpoint_states().borrow().is_terminal()
    }

    fn enqueue(
        self: &Arc<Self>,
        payload: Bytes,
        message_format: u32,
        responder: oneshot::Sender<Result<()>>,
    ) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let tag = DeliveryTag::generate();
        let deadline = Instant::now() + self.retry_policy.try_timeout();
        let timer = self.cancel.child_token();
        {
            let mut state = self.state.lock();
            state.pending.push(PendingSend {
                is_retry: false,
                sequence,
                tag: tag.clone(),
            });
            state.insert(
                tag,
                WorkItem {
                    sequence,
                    payload,
                    message_format,
                    retry_count: 0,
                    deadline,
                    awaiting_ack: false,
                    last_error: None,
                    responder,
                    timer: timer.clone(),
                },
            );
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = time::sleep_until(deadline) => this.on_timeout(sequence),
            }
        });
        sequence
    }

    /// Drops an item that never reached the dispatcher.
    fn abandon(&self, sequence: u64) {
        if let Some(item) = self.state.lock().remove_sequence(sequence) {
            item.timer.cancel();
        }
    }

    /// Hands pending deliveries to the engine while there is credit. Runs on the dispatcher.
    fn process_send_work(&self) {
        if *self.sender.endpoint_states().borrow() != EndpointState::Active {
            trace!("link {} is not active, sends are deferred", self.link_name);
            return;
        }
        let mut state = self.state.lock();
        while self.sender.credit() > 0 {
            let next = match state.pending.pop() {
                Some(next) => next,
                None => break,
            };
            let item = match state.work_items.get_mut(&next.tag) {
                Some(item) => item,
                // timed out while queued
                None => continue,
            };
            match self
                .sender
                .send(&next.tag, &item.payload, item.message_format)
            {
                Ok(_) => {
                    self.sender.advance();
                    item.awaiting_ack = true;
                    trace!("delivery {} sent on link {}", next.tag, self.link_name);
                }
                Err(err) => {
                    error!(
                        "failed to send delivery {} on link {}, cause: {}.",
                        next.tag, self.link_name, err
                    );
                    if let Some(item) = state.remove(&next.tag) {
                        item.complete(Err(Error::OperationCancelled(format!(
                            "transport failed to send delivery: {}, {}",
                            err, self.context
                        ))));
                    }
                }
            }
        }
    }

    fn on_outcome(self: &Arc<Self>, outcome: DeliveryOutcome) {
        let mut state = self.state.lock();
        let mut item = match state.remove(&outcome.tag) {
            Some(item) => item,
            None => {
                debug!(
                    "outcome of unknown delivery {} on link {}",
                    outcome.tag, self.link_name
                );
                return;
            }
        };
        match outcome.state {
            DeliveryState::Accepted => {
                state.last_link_error = None;
                item.complete(Ok(()));
            }
            DeliveryState::Rejected(remote) => {
                let remote = remote.unwrap_or_else(|| {
                    RemoteError::new(ErrorCondition::InternalError, "delivery rejected")
                });
                let err = Error::from_remote(remote, Some(self.context.clone()));
                if err.is_link_health_error() {
                    state.last_link_error = Some((err.clone(), Instant::now()));
                }
                let delay = self
                    .retry_policy
                    .calculate_retry_delay(&err, item.retry_count);
                match delay {
                    Some(delay) if Instant::now() + delay < item.deadline => {
                        let tag = DeliveryTag::generate();
                        warn!(
                            "delivery {} rejected on link {}, redelivered as {} after {:?}, cause: {}.",
                            outcome.tag, self.link_name, tag, delay, err
                        );
                        item.retry_count += 1;
                        item.awaiting_ack = false;
                        item.last_error = Some(err);
                        state.insert(tag.clone(), item);
                        drop(state);
                        self.schedule_retry(tag, delay);
                    }
                    _ => item.complete(Err(err)),
                }
            }
            DeliveryState::Released => item.complete(Err(Error::OperationCancelled(format!(
                "delivery released by the broker, {}",
                self.context
            )))),
            other => item.complete(Err(Error::IllegalState(format!(
                "unexpected delivery state {:?}, {}",
                other, self.context
            )))),
        }
    }

    fn schedule_retry(self: &Arc<Self>, tag: DeliveryTag, delay: Duration) {
        let this = self.clone();
        let retry_tag = tag.clone();
        let res = self.dispatcher.invoke_delayed(
            move || {
                {
                    let mut state = this.state.lock();
                    let sequence = match state.work_items.get(&retry_tag) {
                        Some(item) => item.sequence,
                        None => return,
                    };
                    state.pending.push(PendingSend {
                        is_retry: true,
                        sequence,
                        tag: retry_tag,
                    });
                }
                this.process_send_work();
            },
            delay,
        );
        if let Err(err) = res {
            if let Some(item) = self.state.lock().remove(&tag) {
                item.complete(Err(err.into()));
            }
        }
    }

    fn on_timeout(&self, sequence: u64) {
        let mut state = self.state.lock();
        let item = match state.remove_sequence(sequence) {
            Some(item) => item,
            None => return,
        };
        let recent_link_error = match state.last_link_error {
            Some((ref err, at))
                if at.elapsed() < SERVER_BUSY_WAIT_TIME.max(self.retry_policy.try_timeout()) =>
            {
                Some(err.clone())
            }
            _ => None,
        };
        let err = recent_link_error.unwrap_or_else(|| {
            Error::Timeout(format!(
                "send did not complete within {:?} (awaiting ack: {}, retries: {}, last error: {}), {}",
                self.retry_policy.try_timeout(),
                item.awaiting_ack,
                item.retry_count,
                item.last_error
                    .as_ref()
                    .map_or_else(|| "none".to_string(), |e| e.to_string()),
                self.context
            ))
        });
        warn!("send timed out on link {}, cause: {}.", self.link_name, err);
        item.complete(Err(err));
    }

    fn fail_all(&self, err: Error) {
        let items = self.state.lock().take_all();
        if !items.is_empty() {
            warn!(
                "fail {} outstanding sends on link {}, cause: {}.",
                items.len(),
                self.link_name,
                err
            );
        }
        for item in items {
            item.complete(Err(err.clone()));
        }
    }

    /// Drives the channel from link events until the link is terminal.
    async fn run_link_events(
        self: Arc<Self>,
        mut outcomes: tokio::sync::mpsc::UnboundedReceiver<DeliveryOutcome>,
    ) {
        let mut states = self.sender.endpoint_states();
        let mut credits = self.sender.credit_updates();
        let mut credits_open = true;
        let mut outcomes_open = true;
        loop {
            let state = states.borrow_and_update().clone();
            match state {
                EndpointState::Active => self.trigger_send_work(),
                EndpointState::Errored(remote) => {
                    self.on_link_terminated(Error::from_remote(remote, Some(self.context.clone())));
                    break;
                }
                EndpointState::Closed => {
                    self.on_link_terminated(Error::IllegalState(format!(
                        "link closed, {}",
                        self.context
                    )));
                    break;
                }
                EndpointState::Uninitialized => {}
            }
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = states.changed() => {
                        if changed.is_err() {
                            self.on_link_terminated(Error::IllegalState(format!(
                                "link endpoint is gone, {}",
                                self.context
                            )));
                            return;
                        }
                        break;
                    }
                    changed = credits.changed(), if credits_open => match changed {
                        Ok(()) => self.trigger_send_work(),
                        Err(_) => credits_open = false,
                    },
                    outcome = outcomes.recv(), if outcomes_open => match outcome {
                        Some(outcome) => self.on_outcome(outcome),
                        None => outcomes_open = false,
                    },
                }
            }
        }
    }

    fn trigger_send_work(self: &Arc<Self>) {
        let this = self.clone();
        if let Err(err) = self.dispatcher.invoke(move || this.process_send_work()) {
            debug!(
                "failed to schedule sends on link {}, cause: {}.",
                self.link_name, err
            );
        }
    }

    fn on_link_terminated(&self, err: Error) {
        info!("link {} terminated, cause: {}.", self.link_name, err);
        self.is_disposed.store(true, Ordering::Release);
        self.fail_all(err);
    }

    async fn watch_authorization(self: Arc<Self>, token_manager: Arc<TokenManager>) {
        let mut results = token_manager.authorization_results();
        loop {
            let failure = match results.borrow_and_update().as_ref() {
                Some(AuthorizationResult::Failed(err)) => Some(err.clone()),
                _ => None,
            };
            if let Some(err) = failure {
                error!(
                    "authorization of link {} failed, closing it, cause: {}.",
                    self.link_name, err
                );
                let sender = self.sender.clone();
                let remote = RemoteError::new(ErrorCondition::UnauthorizedAccess, &err.to_string());
                if let Err(closed) = self.dispatcher.invoke(move || sender.close(Some(remote))) {
                    debug!(
                        "link {} closed with its connection, cause: {}.",
                        self.link_name, closed
                    );
                }
                self.on_link_terminated(err);
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = results.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
