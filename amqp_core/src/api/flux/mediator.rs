use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    api::{
        credit::{create_accounting, CreditAccounting, CreditFlowMode},
        error::{Error, ErrorContext},
        message::Message,
        receiver::ReceiveLink,
    },
    engine::{EndpointState, ErrorCondition, RemoteError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MediatorEvent {
    /// The link became active and its credit accounting is set up.
    Active,
    /// Messages were queued, or the mediator is done.
    Drain,
}

pub(super) type EventHandler = Arc<dyn Fn(MediatorEvent) + Send + Sync + 'static>;

/// Buffers the messages of one receive link for the flux draining it.
pub(super) struct Mediator {
    link: Arc<dyn ReceiveLink>,
    context: ErrorContext,
    prefetch: u32,
    credit_mode: CreditFlowMode,
    queue: Mutex<VecDeque<Message>>,
    /// Set once the link's message stream ended, after the last message was queued.
    done: AtomicBool,
    error: Mutex<Option<Error>>,
    is_active: AtomicBool,
    accounting: Mutex<Option<Box<dyn CreditAccounting>>>,
    /// Messages the pump may take from the link, request-driven mode only.
    upstream: Arc<Semaphore>,
    retry_initiated: AtomicBool,
    cancel: CancellationToken,
    runtime: Handle,
}

impl Mediator {
    pub(super) fn new(
        link: Arc<dyn ReceiveLink>,
        prefetch: u32,
        credit_mode: CreditFlowMode,
        cancel: CancellationToken,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            context: ErrorContext::for_link(link.hostname(), link.entity_path(), link.link_name()),
            link,
            prefetch,
            credit_mode,
            queue: Mutex::new(VecDeque::new()),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            is_active: AtomicBool::new(false),
            accounting: Mutex::new(None),
            upstream: Arc::new(Semaphore::new(0)),
            retry_initiated: AtomicBool::new(false),
            cancel,
            runtime,
        })
    }

    pub(super) fn link(&self) -> &Arc<dyn ReceiveLink> {
        &self.link
    }

    pub(super) fn link_name(&self) -> &str {
        self.link.link_name()
    }

    /// Starts pumping messages and watching the link endpoint.
    pub(super) fn start(self: &Arc<Self>, on_event: EventHandler) {
        let messages = self.link.take_messages();
        self.runtime
            .spawn(self.clone().run_pump(messages, on_event.clone()));
        self.runtime.spawn(self.clone().run_state_watcher(on_event));
    }

    async fn run_pump(
        self: Arc<Self>,
        messages: Option<tokio::sync::mpsc::UnboundedReceiver<Message>>,
        on_event: EventHandler,
    ) {
        let mut messages = match messages {
            Some(messages) => messages,
            None => {
                self.record_error(Error::IllegalState(format!(
                    "messages of link already taken, {}",
                    self.context
                )));
                self.done.store(true, Ordering::Release);
                on_event(MediatorEvent::Drain);
                return;
            }
        };
        loop {
            if self.credit_mode == CreditFlowMode::RequestDriven {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    permit = self.upstream.acquire() => match permit {
                        Ok(permit) => permit.forget(),
                        Err(_) => return,
                    },
                }
            }
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return,
                message = messages.recv() => message,
            };
            let message = match message {
                Some(message) => message,
                None => break,
            };
            if !self.offer(message) {
                break;
            }
            on_event(MediatorEvent::Drain);
        }

        let state = self.link.endpoint_states().borrow().clone();
        if let EndpointState::Errored(err) = state {
            self.record_error(Error::from_remote(err, Some(self.context.clone())));
        }
        debug!("messages of link {} ended", self.link_name());
        self.done.store(true, Ordering::Release);
        on_event(MediatorEvent::Drain);
    }

    /// Queues `message`, `false` if the queue cannot grow.
    fn offer(&self, message: Message) -> bool {
        let mut queue = self.queue.lock();
        if let Err(err) = queue.try_reserve(1) {
            error!(
                "failed to buffer message of link {}, dropping it, cause: {}.",
                self.link_name(),
                err
            );
            drop(queue);
            self.record_error(Error::from_remote(
                RemoteError::new(
                    ErrorCondition::ResourceLimitExceeded,
                    "message buffer of the link is full",
                ),
                Some(self.context.clone()),
            ));
            return false;
        }
        queue.push_back(message);
        true
    }

    async fn run_state_watcher(self: Arc<Self>, on_event: EventHandler) {
        let mut states = self.link.endpoint_states();
        loop {
            let state = states.borrow_and_update().clone();
            match state {
                EndpointState::Active => {
                    if !self.is_active.swap(true, Ordering::AcqRel) {
                        self.on_active(&on_event);
                    }
                }
                EndpointState::Errored(err) => {
                    self.record_error(Error::from_remote(err, Some(self.context.clone())));
                    return;
                }
                EndpointState::Closed => return,
                EndpointState::Uninitialized => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn on_active(&self, on_event: &EventHandler) {
        match create_accounting(
            self.credit_mode,
            self.link.clone(),
            self.prefetch,
            self.upstream.clone(),
        ) {
            Ok(accounting) => {
                info!("link {} is active", self.link_name());
                *self.accounting.lock() = Some(accounting);
                on_event(MediatorEvent::Active);
            }
            Err(err) => {
                error!(
                    "failed to set up credit of link {}, cause: {}.",
                    self.link_name(),
                    err
                );
                self.record_error(err);
                self.done.store(true, Ordering::Release);
                on_event(MediatorEvent::Drain);
            }
        }
    }

    fn record_error(&self, err: Error) {
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(err);
        }
    }

    pub(super) fn poll(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    /// `true` once the link ended and every queued message was taken.
    pub(super) fn is_drained_and_done(&self) -> bool {
        self.done.load(Ordering::Acquire) && self.queue.lock().is_empty()
    }

    pub(super) fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire) && !self.done.load(Ordering::Acquire)
    }

    pub(super) fn error(&self) -> Option<Error> {
        self.error.lock().clone()
    }

    pub(super) fn update_credit(&self, requested: u64, emitted: u64) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if let Some(ref mut accounting) = *self.accounting.lock() {
            accounting.update(requested, emitted);
        }
    }

    /// `true` for the first caller only.
    pub(super) fn begin_retire(&self) -> bool {
        !self.retry_initiated.swap(true, Ordering::AcqRel)
    }

    /// Stops the pump and closes the link.
    pub(super) fn dispose(&self) {
        self.cancel.cancel();
        let link = self.link.clone();
        self.runtime.spawn(async move {
            link.close().await;
        });
        let dropped = self.queue.lock().len();
        if dropped > 0 {
            warn!(
                "{} buffered messages of link {} dropped",
                dropped,
                self.link_name()
            );
        }
    }
}
