//! Request-response exchanges with management nodes such as `$cbs`.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{DeliveryState, EndpointState};

use super::{
    cache::RecoverableResource,
    error::{Error, ErrorContext},
    message::Message,
    receiver::{ReactorReceiver, ReceiveLink},
    sender::ReactorSender,
    Result,
};

type Responder = oneshot::Sender<Result<Message>>;

/// Correlates requests sent on a sender link with responses arriving on a receiver link.
pub struct RequestResponseChannel {
    name: String,
    reply_to: String,
    sender: ReactorSender,
    receiver: Arc<ReactorReceiver>,
    pending: Mutex<HashMap<String, Responder>>,
    is_disposed: AtomicBool,
    cancel: CancellationToken,
}

impl RequestResponseChannel {
    /// `sender` and `receiver` must be attached to the same node.
    pub(crate) fn new(
        name: &str,
        reply_to: &str,
        sender: ReactorSender,
        receiver: Arc<ReactorReceiver>,
    ) -> Result<Arc<Self>> {
        let responses = receiver.take_messages().ok_or_else(|| {
            Error::IllegalState(format!("responses of channel {} already taken", name))
        })?;
        let this = Arc::new(Self {
            name: name.to_owned(),
            reply_to: reply_to.to_owned(),
            sender,
            receiver,
            pending: Mutex::new(HashMap::new()),
            is_disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(this.clone().run_responses(responses));
        tokio::spawn(this.clone().watch_sender());
        Ok(this)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends `message` and waits for the response correlated with it.
    ///
    /// # Errors
    ///
    /// Returns the send error, or the error of the link that terminated before the response
    /// arrived.
    pub async fn send_with_ack(&self, mut message: Message) -> Result<Message> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        let message_id = Uuid::new_v4().to_string();
        message.message_id = Some(message_id.clone());
        message.reply_to = Some(self.reply_to.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(message_id.clone(), tx);
        // lost the race with termination
        if self.is_disposed.load(Ordering::Acquire) {
            self.pending.lock().remove(&message_id);
            return Err(self.disposed_error());
        }

        let sent = match self.receiver.add_credits(1) {
            Ok(()) => self.sender.send(&message).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            self.pending.lock().remove(&message_id);
            return Err(err);
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(self.disposed_error()),
        }
    }

    fn disposed_error(&self) -> Error {
        Error::IllegalState(format!(
            "request-response channel {} is disposed",
            self.name
        ))
    }

    /// Marks the channel disposed and fails every pending request with `err`.
    fn terminate(&self, err: Error) {
        if self.is_disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending: Vec<Responder> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            warn!(
                "fail {} pending requests of channel {}, cause: {}.",
                pending.len(),
                self.name,
                err
            );
        }
        for tx in pending {
            let _ = tx.send(Err(err.clone()));
        }
    }

    async fn run_responses(self: Arc<Self>, mut responses: tokio::sync::mpsc::UnboundedReceiver<Message>) {
        loop {
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return,
                response = responses.recv() => response,
            };
            let response = match response {
                Some(response) => response,
                None => break,
            };
            let responder = response
                .correlation_id
                .as_ref()
                .and_then(|id| self.pending.lock().remove(id));
            if let Some(tag) = response.delivery_tag().cloned() {
                if let Err(err) = self
                    .receiver
                    .update_disposition(&tag, DeliveryState::Accepted)
                    .await
                {
                    debug!(
                        "failed to settle response on channel {}, cause: {}.",
                        self.name, err
                    );
                }
            }
            match responder {
                Some(tx) => {
                    let _ = tx.send(Ok(response));
                }
                None => warn!(
                    "response with unknown correlation id {:?} on channel {} dropped",
                    response.correlation_id, self.name
                ),
            }
        }
        let err = link_error(&self.receiver.endpoint_states().borrow(), self.receiver.context());
        self.terminate(err);
    }

    async fn watch_sender(self: Arc<Self>) {
        let res = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = self.sender.wait_for_active() => res,
        };
        if let Err(err) = res {
            self.terminate(err);
            return;
        }
        let mut states = self.sender.endpoint_states();
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
        let err = link_error(&states.borrow(), self.sender.context());
        self.terminate(err);
    }
}

fn link_error(state: &EndpointState, context: &ErrorContext) -> Error {
    match state {
        EndpointState::Errored(err) => Error::from_remote(err.clone(), Some(context.clone())),
        _ => Error::IllegalState(format!("link closed, {}", context)),
    }
}

#[async_trait]
impl RecoverableResource for RequestResponseChannel {
    fn resource_id(&self) -> &str {
        &self.name
    }

    fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::Acquire)
            || self.sender.is_disposed()
            || self.receiver.is_disposed()
    }

    async fn wait_for_active(&self) -> Result<()> {
        tokio::try_join!(self.sender.wait_for_active(), self.receiver.wait_for_active())?;
        Ok(())
    }

    async fn close(&self) {
        info!("close request-response channel {}", self.name);
        self.terminate(self.disposed_error());
        self.cancel.cancel();
        self.sender.close();
        self.receiver.close().await;
    }
}

/////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time;

    use super::RequestResponseChannel;
    use crate::{
        api::{
            cache::RecoverableResource,
            error::Error,
            options::SendOptions,
            receiver::ReactorReceiver,
            retry::{AmqpRetryPolicy, RetryOptions},
            sender::ReactorSender,
        },
        engine::{DeliveryState, EndpointState, ErrorCondition, RemoteError},
        net::create_dispatcher,
        test_utils::{setup_logging, JsonSerializer, MockReactorProvider, MockReceiver, MockSender},
        Message, MessageSerializer,
    };

    struct Fixture {
        channel: Arc<RequestResponseChannel>,
        sender: Arc<MockSender>,
        receiver: Arc<MockReceiver>,
    }

    fn fixture(provider: &MockReactorProvider) -> Fixture {
        let (dispatcher, _) =
            create_dispatcher(provider, "conn-1", "ns.example.com", 5671, 1024).unwrap();
        let sender = MockSender::new("cbs-sender");
        let receiver = MockReceiver::new("cbs-receiver");
        sender.set_credit(100);
        sender.set_state(EndpointState::Active);
        receiver.set_state(EndpointState::Active);
        let serializer = Arc::new(JsonSerializer);
        let reactor_sender = ReactorSender::new(
            "ns.example.com",
            "$cbs",
            sender.clone(),
            dispatcher.clone(),
            serializer.clone(),
            AmqpRetryPolicy::shared(RetryOptions::default()),
            None,
            SendOptions::new(),
        )
        .unwrap();
        let reactor_receiver = ReactorReceiver::new(
            "ns.example.com",
            "$cbs",
            receiver.clone(),
            dispatcher,
            serializer,
            None,
        )
        .unwrap();
        let channel =
            RequestResponseChannel::new("cbs", "cbs-reply", reactor_sender, reactor_receiver)
                .unwrap();
        Fixture {
            channel,
            sender,
            receiver,
        }
    }

    /// Answers the next request on the mock links, echoing its body.
    async fn answer(fixture: &Fixture, status: i64) -> Message {
        let tag = time::timeout(Duration::from_secs(5), fixture.sender.next_sent())
            .await
            .unwrap()
            .unwrap();
        let request = JsonSerializer
            .decode(&fixture.sender.payload(&tag).unwrap())
            .unwrap();
        fixture.sender.respond(&tag, DeliveryState::Accepted);

        let mut response = Message::new(request.body.clone()).with_property("status-code", status);
        response.correlation_id = request.message_id.clone();
        fixture
            .receiver
            .deliver(JsonSerializer.encode(&response).unwrap());
        request
    }

    #[tokio::test]
    async fn test_response_is_correlated() {
        setup_logging();
        let provider = MockReactorProvider::new();
        let fixture = fixture(&provider);

        let request = {
            let channel = fixture.channel.clone();
            tokio::spawn(async move { channel.send_with_ack(Message::new("ping")).await })
        };
        let sent = answer(&fixture, 200).await;
        let response = request.await.unwrap().unwrap();

        assert_eq!(Some("cbs-reply"), sent.reply_to.as_deref());
        assert_eq!(sent.message_id, response.correlation_id);
        assert_eq!(Some(&crate::PropertyValue::Long(200)), response.property("status-code"));
        // one credit per request, response settled
        assert_eq!(vec![1], fixture.receiver.flows());
        time::timeout(Duration::from_secs(1), async {
            while fixture.receiver.settled().is_empty() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(DeliveryState::Accepted, fixture.receiver.settled()[0].1);
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_dropped() {
        setup_logging();
        let provider = MockReactorProvider::new();
        let fixture = fixture(&provider);

        let mut stray = Message::new("stray");
        stray.correlation_id = Some("unknown".to_string());
        fixture.receiver.deliver(JsonSerializer.encode(&stray).unwrap());

        let request = {
            let channel = fixture.channel.clone();
            tokio::spawn(async move { channel.send_with_ack(Message::new("ping")).await })
        };
        let sent = answer(&fixture, 202).await;
        assert_eq!(sent.message_id, request.await.unwrap().unwrap().correlation_id);
        assert!(!fixture.channel.is_disposed());
    }

    #[tokio::test]
    async fn test_link_termination_fails_pending_requests() {
        setup_logging();
        let provider = MockReactorProvider::new();
        let fixture = fixture(&provider);

        let request = {
            let channel = fixture.channel.clone();
            tokio::spawn(async move { channel.send_with_ack(Message::new("ping")).await })
        };
        let tag = time::timeout(Duration::from_secs(5), fixture.sender.next_sent())
            .await
            .unwrap()
            .unwrap();
        fixture.sender.respond(&tag, DeliveryState::Accepted);
        fixture.receiver.detach(Some(RemoteError::new(
            ErrorCondition::LinkDetachForced,
            "idle",
        )));

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(Some(&ErrorCondition::LinkDetachForced), err.condition());
        assert!(fixture.channel.is_disposed());
        assert!(matches!(
            fixture.channel.send_with_ack(Message::new("again")).await,
            Err(Error::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        setup_logging();
        let provider = MockReactorProvider::new();
        let fixture = fixture(&provider);
        fixture.channel.wait_for_active().await.unwrap();

        fixture.channel.close().await;
        fixture.channel.close().await;
        assert!(fixture.channel.is_disposed());
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(1, fixture.sender.close_count());
        assert_eq!(1, fixture.receiver.close_count());
    }
}
