//! AMQP sessions, the scope links are created in.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::time;
use tracing::{debug, info};

use crate::{
    engine::{EndpointStates, EngineConnection, EngineSession},
    net::ReactorDispatcher,
};

use super::{
    error::{Error, ErrorContext},
    message::MessageSerializer,
    options::SendOptions,
    receiver::{wait_for_active, ReactorReceiver, ReceiveLink},
    retry::RetryPolicy,
    sender::ReactorSender,
    token::TokenManager,
    Result,
};

/// A session of a [`ReactorConnection`].
///
/// [`ReactorConnection`]: crate::connection::ReactorConnection
pub struct ReactorSession {
    name: String,
    namespace: String,
    session: Arc<dyn EngineSession>,
    dispatcher: ReactorDispatcher,
    serializer: Arc<dyn MessageSerializer>,
    retry_policy: Arc<dyn RetryPolicy>,
    senders: Mutex<HashMap<String, ReactorSender>>,
    receivers: Mutex<Vec<Arc<ReactorReceiver>>>,
    is_disposed: AtomicBool,
    context: ErrorContext,
}

impl fmt::Debug for ReactorSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReactorSession")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("is_disposed", &self.is_disposed())
            .finish()
    }
}

impl ReactorSession {
    /// Begins the session on the dispatcher and waits for it to become active.
    pub(crate) async fn open(
        name: &str,
        namespace: &str,
        connection: Arc<dyn EngineConnection>,
        dispatcher: ReactorDispatcher,
        serializer: Arc<dyn MessageSerializer>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Arc<Self>> {
        let session_name = name.to_owned();
        let session = dispatcher
            .invoke_and_wait(move || {
                let session = connection.session(&session_name);
                session.open();
                session
            })
            .await?;

        let this = Arc::new(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            session,
            dispatcher,
            serializer,
            retry_policy,
            senders: Mutex::new(HashMap::new()),
            receivers: Mutex::new(Vec::new()),
            is_disposed: AtomicBool::new(false),
            context: ErrorContext::new(namespace),
        });

        let try_timeout = this.retry_policy.try_timeout();
        let res = time::timeout(
            try_timeout,
            wait_for_active(this.session.endpoint_states(), &this.context),
        )
        .await;
        match res {
            Ok(Ok(())) => {
                debug!("session {} of {} is active", this.name, this.namespace);
                Ok(this)
            }
            Ok(Err(err)) => {
                this.close().await;
                Err(err)
            }
            Err(_) => {
                this.close().await;
                Err(Error::Timeout(format!(
                    "session {} did not become active within {:?}, {}",
                    this.name, try_timeout, this.context
                )))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint_states(&self) -> EndpointStates {
        self.session.endpoint_states()
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::Acquire)
            || self.session.endpoint_states().borrow().is_terminal()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::IllegalState(format!(
                "session {} is closed, {}",
                self.name, self.context
            )));
        }
        Ok(())
    }

    /// Returns the live sender named `link_name`, or attaches a new one.
    pub async fn create_producer(
        &self,
        link_name: &str,
        entity_path: &str,
        token_manager: Option<Arc<TokenManager>>,
        options: &SendOptions,
    ) -> Result<ReactorSender> {
        self.check_open()?;
        if let Some(sender) = self.live_sender(link_name) {
            if let Some(token_manager) = token_manager {
                // the existing link keeps its own token manager
                token_manager.close();
            }
            return Ok(sender);
        }

        let session = self.session.clone();
        let (name, path) = (link_name.to_owned(), entity_path.to_owned());
        let engine = self
            .dispatcher
            .invoke_and_wait(move || {
                let sender = session.sender(&name, &path);
                sender.open();
                sender
            })
            .await?;
        let sender = ReactorSender::new(
            &self.namespace,
            entity_path,
            engine,
            self.dispatcher.clone(),
            self.serializer.clone(),
            self.retry_policy.clone(),
            token_manager,
            options.clone(),
        )?;

        let existing = {
            let mut senders = self.senders.lock();
            match senders.get(link_name) {
                Some(existing) if !existing.is_disposed() => Some(existing.clone()),
                _ => {
                    senders.insert(link_name.to_owned(), sender.clone());
                    None
                }
            }
        };
        match existing {
            // lost a race with a concurrent creation of the same link
            Some(existing) => {
                sender.close();
                Ok(existing)
            }
            None => {
                info!(
                    "created sender {} to {} on session {}",
                    link_name, entity_path, self.name
                );
                Ok(sender)
            }
        }
    }

    fn live_sender(&self, link_name: &str) -> Option<ReactorSender> {
        let mut senders = self.senders.lock();
        match senders.get(link_name) {
            Some(sender) if !sender.is_disposed() => Some(sender.clone()),
            Some(_) => {
                senders.remove(link_name);
                None
            }
            None => None,
        }
    }

    /// Attaches a new receiver. The link holds no credit until it is added.
    pub async fn create_consumer(
        &self,
        link_name: &str,
        entity_path: &str,
        token_manager: Option<Arc<TokenManager>>,
    ) -> Result<Arc<ReactorReceiver>> {
        self.check_open()?;
        let session = self.session.clone();
        let (name, path) = (link_name.to_owned(), entity_path.to_owned());
        let engine = self
            .dispatcher
            .invoke_and_wait(move || {
                let receiver = session.receiver(&name, &path);
                receiver.open();
                receiver
            })
            .await?;
        let receiver = ReactorReceiver::new(
            &self.namespace,
            entity_path,
            engine,
            self.dispatcher.clone(),
            self.serializer.clone(),
            token_manager,
        )?;
        {
            let mut receivers = self.receivers.lock();
            receivers.retain(|r| !r.is_disposed());
            receivers.push(receiver.clone());
        }
        info!(
            "created receiver {} from {} on session {}",
            link_name, entity_path, self.name
        );
        Ok(receiver)
    }

    /// Closes the links of the session, then the session. Idempotent.
    pub async fn close(&self) {
        if self.is_disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("close session {} of {}", self.name, self.namespace);
        let senders: Vec<ReactorSender> = self.senders.lock().drain().map(|(_, s)| s).collect();
        for sender in senders {
            sender.close();
        }
        let receivers: Vec<Arc<ReactorReceiver>> = self.receivers.lock().drain(..).collect();
        for receiver in receivers {
            receiver.close().await;
        }
        let session = self.session.clone();
        if let Err(err) = self.dispatcher.invoke(move || session.close(None)) {
            debug!(
                "session {} closed with its connection, cause: {}.",
                self.name, err
            );
        }
    }
}
