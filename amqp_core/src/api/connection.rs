//! AMQP connections and the cache recovering them.
//!
//! A [`ReactorConnection`] owns the dispatcher of one protocol engine and the sessions opened
//! on it. Links are authorized through the connection's `$cbs` node before they are attached.
//!
//! Applications hold a [`ConnectionCache`]. It hands out the current connection and replaces
//! it transparently once it is closed by the broker or fails.
//!
//! # Example
//! ```rust,ignore
//! use std::sync::Arc;
//! use amqp_core::{connection::ConnectionCache, ConnectionOptions, ReceiveOptions, SendOptions};
//!
//! # async fn run(provider: Arc<dyn amqp_core::engine::ReactorProvider>,
//! #     serializer: Arc<dyn amqp_core::MessageSerializer>,
//! #     credential: Arc<dyn amqp_core::cbs::TokenCredential>) -> amqp_core::Result<()> {
//! let options = ConnectionOptions::new("contoso.servicebus.windows.net");
//! let cache = ConnectionCache::new(options, provider, serializer, credential)?;
//!
//! let sender = cache.create_sender("orders", &SendOptions::new()).await?;
//! sender.send(&amqp_core::Message::new("hello")).await?;
//!
//! let flux = cache.create_receiver("orders", ReceiveOptions::new())?;
//! let mut receiver = flux.receiver(10)?;
//! while let Some(message) = receiver.recv().await {
//!     let message = message?;
//!     flux.update_disposition(&message, amqp_core::engine::DeliveryState::Accepted).await?;
//! }
//! cache.dispose().await;
//! # Ok(())
//! # }
//! ```
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    engine::{EndpointStates, EngineConnection, ReactorProvider},
    net::{create_dispatcher, ReactorDispatcher, ShutdownSignal},
};

use super::{
    cache::{RecoverableResource, ResourceCache, ResourceFuture},
    cbs::{ClaimsBasedSecurityChannel, TokenCredential, CBS_NODE_ADDRESS},
    error::{Error, ErrorContext},
    flux::MessageFlux,
    message::MessageSerializer,
    options::{ConnectionOptions, ReceiveOptions, SendOptions},
    receiver::{wait_for_active, ConsumerLinkSource, ReceiveLink},
    request_response::RequestResponseChannel,
    retry::{AmqpRetryPolicy, RetryPolicy},
    sender::ReactorSender,
    session::ReactorSession,
    token::{TokenManager, TokenManagerProvider},
    Result,
};

const CBS_SESSION_NAME: &str = "cbs-session";
const CBS_LINK_NAME: &str = "cbs";

/////////////////////////////////////////////////////////////////////////////
/// One AMQP connection and its sessions.
pub struct ReactorConnection {
    connection_id: String,
    options: ConnectionOptions,
    engine: Arc<dyn EngineConnection>,
    dispatcher: ReactorDispatcher,
    serializer: Arc<dyn MessageSerializer>,
    credential: Arc<dyn TokenCredential>,
    retry_policy: Arc<dyn RetryPolicy>,
    token_provider: TokenManagerProvider,
    sessions: Mutex<HashMap<String, Arc<ReactorSession>>>,
    cbs: Mutex<Option<Arc<ClaimsBasedSecurityChannel>>>,
    is_disposed: AtomicBool,
    context: ErrorContext,
    cancel: CancellationToken,
    /// Weak self reference handed to session watchers and the `$cbs` channel supplier.
    this: Weak<ReactorConnection>,
}

impl fmt::Debug for ReactorConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReactorConnection")
            .field("connection_id", &self.connection_id)
            .field("namespace", &self.options.fully_qualified_namespace)
            .field("is_disposed", &self.is_disposed())
            .finish()
    }
}

impl ReactorConnection {
    /// Builds the engine, starts its event loop and opens the connection.
    pub(crate) fn open(
        connection_id: &str,
        options: &ConnectionOptions,
        provider: &dyn ReactorProvider,
        serializer: Arc<dyn MessageSerializer>,
        credential: Arc<dyn TokenCredential>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Arc<Self>> {
        let (dispatcher, engine) = create_dispatcher(
            provider,
            connection_id,
            &options.hostname,
            options.port,
            options.max_frame_size,
        )?;
        let this = Arc::new_cyclic(|this| Self {
            connection_id: connection_id.to_owned(),
            options: options.clone(),
            engine,
            dispatcher,
            serializer,
            credential,
            retry_policy,
            token_provider: TokenManagerProvider::new(
                &options.fully_qualified_namespace,
                &options.authorization_scope,
            ),
            sessions: Mutex::new(HashMap::new()),
            cbs: Mutex::new(None),
            is_disposed: AtomicBool::new(false),
            context: ErrorContext::new(&options.fully_qualified_namespace),
            cancel: CancellationToken::new(),
            this: this.clone(),
        });

        let engine = this.engine.clone();
        if let Err(err) = this.dispatcher.invoke(move || engine.open()) {
            this.dispatcher.close();
            return Err(err.into());
        }
        tokio::spawn(this.clone().watch_endpoint());
        info!(
            "opening connection {} to {}:{}",
            connection_id, options.hostname, options.port
        );
        Ok(this)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn fully_qualified_namespace(&self) -> &str {
        &self.options.fully_qualified_namespace
    }

    pub fn endpoint_states(&self) -> EndpointStates {
        self.engine.endpoint_states()
    }

    /// Emits once when the reactor of the connection shuts down.
    pub fn shutdown_signals(&self) -> watch::Receiver<Option<ShutdownSignal>> {
        self.dispatcher.shutdown_signals()
    }

    /// `true` once closed, once the connection endpoint is terminal, or once the reactor
    /// stopped.
    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::Acquire)
            || self.dispatcher.is_closed()
            || self.engine.endpoint_states().borrow().is_terminal()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::IllegalState(format!(
                "connection {} is closed, {}",
                self.connection_id, self.context
            )));
        }
        Ok(())
    }

    /// Stops the reactor once the connection endpoint is terminal.
    async fn watch_endpoint(self: Arc<Self>) {
        let mut states = self.engine.endpoint_states();
        loop {
            if states.borrow_and_update().is_terminal() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        let state = states.borrow().clone();
        warn!("connection {} terminated: {}", self.connection_id, state);
        self.dispatcher.close();
    }

    /// Returns the live session named `name`, or begins a new one.
    pub async fn create_session(&self, name: &str) -> Result<Arc<ReactorSession>> {
        self.check_open()?;
        if let Some(session) = self.live_session(name) {
            return Ok(session);
        }
        let session = ReactorSession::open(
            name,
            &self.options.fully_qualified_namespace,
            self.engine.clone(),
            self.dispatcher.clone(),
            self.serializer.clone(),
            self.retry_policy.clone(),
        )
        .await?;

        enum Registered {
            New,
            Existing(Arc<ReactorSession>),
            Disposing,
        }
        let registered = {
            let mut sessions = self.sessions.lock();
            if self.is_disposed.load(Ordering::Acquire) {
                Registered::Disposing
            } else {
                match sessions.get(name) {
                    Some(existing) if !existing.is_disposed() => {
                        Registered::Existing(existing.clone())
                    }
                    _ => {
                        sessions.insert(name.to_owned(), session.clone());
                        Registered::New
                    }
                }
            }
        };
        match registered {
            Registered::New => {
                tokio::spawn(Self::evict_when_terminal(self.this.clone(), session.clone()));
                Ok(session)
            }
            Registered::Existing(existing) => {
                session.close().await;
                Ok(existing)
            }
            Registered::Disposing => {
                session.close().await;
                Err(Error::IllegalState(format!(
                    "connection {} is closing, {}",
                    self.connection_id, self.context
                )))
            }
        }
    }

    fn live_session(&self, name: &str) -> Option<Arc<ReactorSession>> {
        match self.sessions.lock().get(name) {
            Some(session) if !session.is_disposed() => Some(session.clone()),
            _ => None,
        }
    }

    async fn evict_when_terminal(connection: Weak<Self>, session: Arc<ReactorSession>) {
        let mut states = session.endpoint_states();
        while !states.borrow_and_update().is_terminal() {
            if states.changed().await.is_err() {
                break;
            }
        }
        let connection = match connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };
        let evicted = {
            let mut sessions = connection.sessions.lock();
            // the whole map is cleared by close
            if connection.is_disposed.load(Ordering::Acquire) {
                false
            } else {
                match sessions.get(session.name()) {
                    Some(current) if Arc::ptr_eq(current, &session) => {
                        sessions.remove(session.name());
                        true
                    }
                    _ => false,
                }
            }
        };
        if evicted {
            debug!(
                "evicted session {} of connection {}",
                session.name(),
                connection.connection_id
            );
            session.close().await;
        }
    }

    /// The `$cbs` node of the connection, created on first use.
    pub fn cbs_node(&self) -> Result<Arc<ClaimsBasedSecurityChannel>> {
        self.check_open()?;
        let mut cbs = self.cbs.lock();
        if let Some(ref channel) = *cbs {
            return Ok(channel.clone());
        }
        let connection = self.this.clone();
        let channels = Arc::new(ResourceCache::new(
            &format!("{}-cbs", self.connection_id),
            Box::new(move || -> ResourceFuture<RequestResponseChannel> {
                let connection = connection.clone();
                Box::pin(async move {
                    let connection = connection.upgrade().ok_or_else(|| {
                        Error::RecoveryTerminated("connection was dropped".to_string())
                    })?;
                    connection
                        .create_request_response_channel(
                            CBS_SESSION_NAME,
                            CBS_LINK_NAME,
                            CBS_NODE_ADDRESS,
                        )
                        .await
                })
            }),
            self.retry_policy.clone(),
        ));
        let channel = Arc::new(ClaimsBasedSecurityChannel::new(
            channels,
            self.credential.clone(),
            self.options.authorization_type,
            self.retry_policy.clone(),
            &self.options.fully_qualified_namespace,
        ));
        *cbs = Some(channel.clone());
        Ok(channel)
    }

    /// Authorizes access to `entity_path` and keeps the authorization refreshed.
    async fn authorize(&self, entity_path: &str) -> Result<Arc<TokenManager>> {
        let cbs = self.cbs_node()?;
        let token_manager = self.token_provider.token_manager(cbs, entity_path);
        if let Err(err) = token_manager.authorize().await {
            error!(
                "failed to authorize {} on connection {}, cause: {}.",
                entity_path, self.connection_id, err
            );
            token_manager.close();
            return Err(err);
        }
        Ok(token_manager)
    }

    /// Authorizes and attaches a sender to `entity_path`. A live sender of the same name is
    /// reused.
    pub async fn create_producer(
        &self,
        link_name: &str,
        entity_path: &str,
        options: &SendOptions,
    ) -> Result<ReactorSender> {
        self.check_open()?;
        let token_manager = self.authorize(entity_path).await?;
        let session = self.create_session(entity_path).await?;
        session
            .create_producer(link_name, entity_path, Some(token_manager), options)
            .await
    }

    /// Authorizes and attaches a receiver from `entity_path`.
    pub async fn create_consumer(
        &self,
        link_name: &str,
        entity_path: &str,
        _options: &ReceiveOptions,
    ) -> Result<Arc<dyn ReceiveLink>> {
        self.check_open()?;
        let token_manager = self.authorize(entity_path).await?;
        let session = self.create_session(entity_path).await?;
        let receiver = session
            .create_consumer(link_name, entity_path, Some(token_manager))
            .await?;
        Ok(receiver)
    }

    /// Opens a request-response channel to the node `address` on the session `session_name`.
    pub async fn create_request_response_channel(
        &self,
        session_name: &str,
        link_name: &str,
        address: &str,
    ) -> Result<Arc<RequestResponseChannel>> {
        self.check_open()?;
        let session = self.create_session(session_name).await?;
        let sender_name = format!("{}:sender", link_name);
        let receiver_name = format!("{}:receiver", link_name);
        let sender = session
            .create_producer(&sender_name, address, None, &SendOptions::new())
            .await?;
        let receiver = session
            .create_consumer(&receiver_name, address, None)
            .await?;
        RequestResponseChannel::new(link_name, &receiver_name, sender, receiver)
    }

    /// Closes the sessions, the `$cbs` node and the connection. Idempotent.
    pub async fn close(&self) {
        let sessions: Vec<Arc<ReactorSession>> = {
            let mut sessions = self.sessions.lock();
            if self.is_disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            sessions.drain().map(|(_, session)| session).collect()
        };
        info!("close connection {}", self.connection_id);
        self.cancel.cancel();

        let cbs = self.cbs.lock().take();
        if let Some(cbs) = cbs {
            cbs.close().await;
        }
        for session in sessions {
            session.close().await;
        }
        let engine = self.engine.clone();
        if let Err(err) = self.dispatcher.invoke(move || engine.close(None)) {
            debug!(
                "connection {} already shut down, cause: {}.",
                self.connection_id, err
            );
        }
        self.dispatcher.close();
    }
}

#[async_trait]
impl RecoverableResource for ReactorConnection {
    fn resource_id(&self) -> &str {
        &self.connection_id
    }

    fn is_disposed(&self) -> bool {
        ReactorConnection::is_disposed(self)
    }

    async fn wait_for_active(&self) -> Result<()> {
        wait_for_active(self.engine.endpoint_states(), &self.context).await
    }

    async fn close(&self) {
        ReactorConnection::close(self).await;
    }
}

fn generate_connection_id(namespace: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let uuid = Uuid::new_v4().simple().to_string();
    format!(
        "MF_{}_{}@{}",
        &uuid[..6],
        COUNTER.fetch_add(1, Ordering::Relaxed),
        namespace
    )
}

/////////////////////////////////////////////////////////////////////////////
/// Hands out the current connection to a namespace, replacing it once it is closed.
pub struct ConnectionCache {
    connections: ResourceCache<ReactorConnection>,
    options: ConnectionOptions,
    retry_policy: Arc<dyn RetryPolicy>,
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("namespace", &self.options.fully_qualified_namespace)
            .field("connections", &self.connections)
            .finish()
    }
}

impl ConnectionCache {
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `options` are invalid.
    pub fn new(
        options: ConnectionOptions,
        provider: Arc<dyn ReactorProvider>,
        serializer: Arc<dyn MessageSerializer>,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let retry_policy = AmqpRetryPolicy::shared(options.retry_options.clone());

        let supplier_options = options.clone();
        let supplier_policy = retry_policy.clone();
        let supplier = Box::new(move || -> ResourceFuture<ReactorConnection> {
            let options = supplier_options.clone();
            let provider = provider.clone();
            let serializer = serializer.clone();
            let credential = credential.clone();
            let retry_policy = supplier_policy.clone();
            Box::pin(async move {
                let connection_id = generate_connection_id(&options.fully_qualified_namespace);
                ReactorConnection::open(
                    &connection_id,
                    &options,
                    provider.as_ref(),
                    serializer,
                    credential,
                    retry_policy,
                )
            })
        });
        Ok(Arc::new(Self {
            connections: ResourceCache::new(
                &options.fully_qualified_namespace,
                supplier,
                retry_policy.clone(),
            ),
            options,
            retry_policy,
        }))
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// The active connection, opening a new one if the current one is closed.
    pub async fn get_connection(&self) -> Result<Arc<ReactorConnection>> {
        self.connections.get().await
    }

    /// Closes the current connection, no connection is opened afterwards. Idempotent.
    pub async fn dispose(&self) -> bool {
        self.connections.dispose().await
    }

    pub fn is_current_closed(&self) -> bool {
        self.connections.is_current_closed()
    }

    /// Attaches a sender to `entity_path` on the current connection.
    pub async fn create_sender(&self, entity_path: &str, options: &SendOptions) -> Result<ReactorSender> {
        let connection = self.get_connection().await?;
        connection
            .create_producer(entity_path, entity_path, options)
            .await
    }

    /// A message stream from `entity_path` that recovers its link across connection
    /// replacements.
    pub fn create_receiver(
        self: &Arc<Self>,
        entity_path: &str,
        options: ReceiveOptions,
    ) -> Result<MessageFlux> {
        let (prefetch, credit_mode) = (options.prefetch, options.credit_mode);
        let source = Arc::new(ConsumerLinkSource::new(self.clone(), entity_path, options));
        MessageFlux::new(source, prefetch, credit_mode, self.retry_policy.clone())
    }
}
