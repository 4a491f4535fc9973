//! Receive links.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    engine::{
        DeliveryState, DeliveryTag, EndpointState, EndpointStates, EngineReceiver, ErrorCondition,
        InboundDelivery, RemoteError,
    },
    net::ReactorDispatcher,
};

use super::{
    connection::ConnectionCache,
    error::{Error, ErrorContext},
    flux::ReceiveLinkSource,
    message::{Message, MessageSerializer},
    options::ReceiveOptions,
    token::{AuthorizationResult, TokenManager},
    Result,
};

/// A link receiving messages from an entity.
#[async_trait]
pub trait ReceiveLink: Send + Sync + 'static {
    fn link_name(&self) -> &str;

    fn entity_path(&self) -> &str;

    fn hostname(&self) -> &str;

    /// Decoded messages in receipt order. Can be taken once, ends after the link endpoint
    /// reached a terminal state.
    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<Message>>;

    fn endpoint_states(&self) -> EndpointStates;

    /// Credit currently held by the link.
    fn credits(&self) -> u32;

    /// Schedules a flow adding `credits`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is closing or its connection is gone.
    fn add_credits(&self, credits: u32) -> Result<()>;

    /// Settles the delivery `tag` with `state`.
    async fn update_disposition(&self, tag: &DeliveryTag, state: DeliveryState) -> Result<()>;

    /// Closes the link. Idempotent.
    async fn close(&self);

    fn is_disposed(&self) -> bool;
}

/////////////////////////////////////////////////////////////////////////////
/// [`ReceiveLink`] backed by an engine receiver.
pub struct ReactorReceiver {
    link_name: String,
    entity_path: String,
    hostname: String,
    receiver: Arc<dyn EngineReceiver>,
    dispatcher: ReactorDispatcher,
    token_manager: Option<Arc<TokenManager>>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    is_disposed: AtomicBool,
    context: ErrorContext,
    cancel: CancellationToken,
}

impl ReactorReceiver {
    /// Wraps an engine receiver that has been opened on the dispatcher.
    pub(crate) fn new(
        namespace: &str,
        entity_path: &str,
        receiver: Arc<dyn EngineReceiver>,
        dispatcher: ReactorDispatcher,
        serializer: Arc<dyn MessageSerializer>,
        token_manager: Option<Arc<TokenManager>>,
    ) -> Result<Arc<Self>> {
        let link_name = receiver.name().to_owned();
        let deliveries = receiver.take_deliveries().ok_or_else(|| {
            Error::IllegalState(format!("deliveries of link {} already taken", link_name))
        })?;
        let (tx, rx) = mpsc::unbounded_channel();

        let this = Arc::new(Self {
            context: ErrorContext::for_link(namespace, entity_path, &link_name),
            link_name,
            entity_path: entity_path.to_owned(),
            hostname: namespace.to_owned(),
            receiver,
            dispatcher,
            token_manager,
            messages: Mutex::new(Some(rx)),
            is_disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        this.spawn_decoder(deliveries, serializer, tx);
        if let Some(ref token_manager) = this.token_manager {
            this.spawn_authorization_watcher(token_manager.clone());
        }
        Ok(this)
    }

    fn spawn_decoder(
        self: &Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<InboundDelivery>,
        serializer: Arc<dyn MessageSerializer>,
        tx: mpsc::UnboundedSender<Message>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                match serializer.decode(&delivery.payload) {
                    Ok(mut message) => {
                        message.set_delivery(delivery.tag, &this.link_name);
                        if tx.send(message).is_err() {
                            debug!("messages of link {} are no longer consumed", this.link_name);
                        }
                    }
                    Err(err) => {
                        warn!(
                            "failed to decode delivery {} on link {}, cause: {}.",
                            delivery.tag, this.link_name, err
                        );
                        let receiver = this.receiver.clone();
                        let state = DeliveryState::Rejected(Some(RemoteError::new(
                            ErrorCondition::DecodeError,
                            &err.to_string(),
                        )));
                        if let Err(err) = this
                            .dispatcher
                            .invoke(move || receiver.settle(&delivery.tag, &state))
                        {
                            debug!(
                                "failed to reject undecodable delivery on link {}, cause: {}.",
                                this.link_name, err
                            );
                        }
                    }
                }
            }
            // detached, make sure the link is terminal before ending the message stream
            let mut states = this.receiver.endpoint_states();
            while !states.borrow_and_update().is_terminal() {
                if states.changed().await.is_err() {
                    break;
                }
            }
            debug!("message stream of link {} ends", this.link_name);
        });
    }

    fn spawn_authorization_watcher(self: &Arc<Self>, token_manager: Arc<TokenManager>) {
        let this = self.clone();
        let mut results = token_manager.authorization_results();
        tokio::spawn(async move {
            loop {
                let failure = match results.borrow_and_update().as_ref() {
                    Some(AuthorizationResult::Failed(err)) => Some(err.clone()),
                    _ => None,
                };
                if let Some(err) = failure {
                    error!(
                        "authorization of link {} failed, closing it, cause: {}.",
                        this.link_name, err
                    );
                    this.close_with_error(Some(RemoteError::new(
                        ErrorCondition::UnauthorizedAccess,
                        &err.to_string(),
                    )));
                    break;
                }
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    changed = results.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub(crate) fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Waits until the engine reports the link active.
    pub(crate) async fn wait_for_active(&self) -> Result<()> {
        wait_for_active(self.receiver.endpoint_states(), &self.context).await
    }

    fn close_with_error(&self, error: Option<RemoteError>) {
        if self.is_disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("close link {} of {}", self.link_name, self.entity_path);
        self.cancel.cancel();
        let receiver = self.receiver.clone();
        if let Err(err) = self.dispatcher.invoke(move || receiver.close(error)) {
            debug!(
                "link {} closed with its connection, cause: {}.",
                self.link_name, err
            );
        }
        if let Some(ref token_manager) = self.token_manager {
            token_manager.close();
        }
    }
}

#[async_trait]
impl ReceiveLink for ReactorReceiver {
    fn link_name(&self) -> &str {
        &self.link_name
    }

    fn entity_path(&self) -> &str {
        &self.entity_path
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.messages.lock().take()
    }

    fn endpoint_states(&self) -> EndpointStates {
        self.receiver.endpoint_states()
    }

    fn credits(&self) -> u32 {
        self.receiver.credit()
    }

    fn add_credits(&self, credits: u32) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::IllegalState(format!(
                "cannot add credits, link is closed, {}",
                self.context
            )));
        }
        let receiver = self.receiver.clone();
        self.dispatcher.invoke(move || receiver.flow(credits))?;
        Ok(())
    }

    async fn update_disposition(&self, tag: &DeliveryTag, state: DeliveryState) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::IllegalState(format!(
                "cannot settle delivery {}, link is closed, {}",
                tag, self.context
            )));
        }
        let receiver = self.receiver.clone();
        let tag = tag.clone();
        self.dispatcher
            .invoke_and_wait(move || receiver.settle(&tag, &state))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.close_with_error(None);
    }

    fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::Acquire)
            || self.receiver.endpoint_states().borrow().is_terminal()
    }
}

/// Resolves once `states` reads active, fails if it reaches a terminal state first.
pub(crate) async fn wait_for_active(mut states: EndpointStates, context: &ErrorContext) -> Result<()> {
    loop {
        match states.borrow_and_update().clone() {
            EndpointState::Active => return Ok(()),
            EndpointState::Errored(err) => return Err(Error::from_remote(err, Some(context.clone()))),
            EndpointState::Closed => {
                return Err(Error::IllegalState(format!(
                    "endpoint closed before becoming active, {}",
                    context
                )))
            }
            EndpointState::Uninitialized => {}
        }
        if states.changed().await.is_err() {
            return Err(Error::IllegalState(format!(
                "endpoint state stream ended before becoming active, {}",
                context
            )));
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Obtains a fresh consumer link from the connection cache every time one is needed.
pub struct ConsumerLinkSource {
    connection_cache: Arc<ConnectionCache>,
    entity_path: String,
    options: ReceiveOptions,
}

impl ConsumerLinkSource {
    pub fn new(connection_cache: Arc<ConnectionCache>, entity_path: &str, options: ReceiveOptions) -> Self {
        Self {
            connection_cache,
            entity_path: entity_path.to_owned(),
            options,
        }
    }
}

#[async_trait]
impl ReceiveLinkSource for ConsumerLinkSource {
    async fn next_link(&self) -> Result<Option<Arc<dyn ReceiveLink>>> {
        let connection = self.connection_cache.get_connection().await?;
        let link_name = format!("{}_{}", self.entity_path, Uuid::new_v4());
        let link = connection
            .create_consumer(&link_name, &self.entity_path, &self.options)
            .await?;
        Ok(Some(link))
    }
}
