use std::{
    collections::VecDeque,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch, Notify},
    time,
};
use tracing::{debug, error, info, trace, warn};

use crate::engine::{EngineConnection, Reactor, ReactorProvider};

use super::Error;

/// A unit of work that must run on the reactor's logical thread.
pub(crate) type Work = Box<dyn FnOnce() + Send + 'static>;

/////////////////////////////////////////////////////////////////////////////
/// Emitted once when the reactor of a connection shuts down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    initiated_by_client: bool,
    is_transient: bool,
    description: String,
}

impl ShutdownSignal {
    pub(crate) fn new(initiated_by_client: bool, is_transient: bool, description: &str) -> Self {
        Self {
            initiated_by_client,
            is_transient,
            description: description.to_owned(),
        }
    }

    /// `true` if the shutdown is the result of a `close` by this client.
    pub fn is_initiated_by_client(&self) -> bool {
        self.initiated_by_client
    }

    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "shutdown (initiated by client: {}, transient: {}): {}",
            self.initiated_by_client, self.is_transient, self.description
        )
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Funnels work onto the single task that drives the protocol engine.
///
/// The engine is not thread safe. Any interaction with engine endpoints
/// (open, close, flow, send, settle) is submitted through `invoke`, queued,
/// and the reactor's event loop is woken up to drain the queue.
#[derive(Clone)]
pub(crate) struct ReactorDispatcher {
    shared: Arc<DispatcherShared>,
}

struct DispatcherShared {
    connection_id: String,
    work_queue: Mutex<VecDeque<Work>>,
    /// Wake-up channel of the event loop. A stored permit coalesces concurrent signals.
    wakeup: Notify,
    /// Set once the executor stopped accepting work.
    is_closed: AtomicBool,
    close_requested: AtomicBool,
    shutdown_emitted: AtomicBool,
    shutdown_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl fmt::Debug for ReactorDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReactorDispatcher")
            .field("connection_id", &self.shared.connection_id)
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl ReactorDispatcher {
    fn new(connection_id: &str) -> Self {
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(DispatcherShared {
                connection_id: connection_id.to_owned(),
                work_queue: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                is_closed: AtomicBool::new(false),
                close_requested: AtomicBool::new(false),
                shutdown_emitted: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    pub(crate) fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    /// Schedules `work` to run on the reactor thread.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if the reactor or its wake-up channel is closed.
    pub(crate) fn invoke<F>(&self, work: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            // the executor flips `is_closed` under this lock before its final drain
            let mut queue = self.shared.work_queue.lock();
            self.check_accepting()?;
            queue.push_back(Box::new(work));
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    fn check_accepting(&self) -> Result<(), Error> {
        if self.is_closed() || self.shared.close_requested.load(Ordering::Acquire) {
            return Err(Error::Rejected(format!(
                "reactor dispatcher of connection {} is closed",
                self.shared.connection_id
            )));
        }
        Ok(())
    }

    /// Schedules `work` to run on the reactor thread after `delay`.
    pub(crate) fn invoke_delayed<F>(&self, work: F, delay: Duration) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_accepting()?;
        let dispatcher = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Err(err) = dispatcher.invoke(work) {
                warn!(
                    "delayed work dropped on connection {}, cause: {}.",
                    dispatcher.connection_id(),
                    err
                );
            }
        });
        Ok(())
    }

    /// Runs `work` on the reactor thread and returns its result.
    pub(crate) async fn invoke_and_wait<F, R>(&self, work: F) -> Result<R, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.invoke(move || {
            let _ = tx.send(work());
        })?;
        Ok(rx.await?)
    }

    /// Requests the reactor to shut down. Idempotent.
    pub(crate) fn close(&self) {
        if self.shared.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("close requested for reactor of connection {}", self.connection_id());
        self.shared.wakeup.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.is_closed.load(Ordering::Acquire)
    }

    /// Shutdown notifications. Holds `Some` once the reactor has stopped.
    pub(crate) fn shutdown_signals(&self) -> watch::Receiver<Option<ShutdownSignal>> {
        self.shared.shutdown_tx.subscribe()
    }

    fn emit_shutdown(&self, signal: ShutdownSignal) {
        if self
            .shared
            .shutdown_emitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!(
            "reactor of connection {} emits {}",
            self.connection_id(),
            signal
        );
        self.shared.shutdown_tx.send_replace(Some(signal));
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Builds the engine of a connection and spawns its event loop.
pub(crate) fn create_dispatcher(
    provider: &dyn ReactorProvider,
    connection_id: &str,
    hostname: &str,
    port: u16,
    max_frame_size: u32,
) -> Result<(ReactorDispatcher, Arc<dyn EngineConnection>), Error> {
    if max_frame_size == 0 {
        return Err(Error::InvalidArgument(format!(
            "max frame size of connection {} must be greater than 0",
            connection_id
        )));
    }
    let (reactor, connection) =
        provider.create_reactor(connection_id, hostname, port, max_frame_size)?;

    let dispatcher = ReactorDispatcher::new(connection_id);
    let executor = ReactorExecutor::new(reactor, dispatcher.clone());
    tokio::spawn(async move {
        executor.run_until_shutdown().await;
    });
    Ok((dispatcher, connection))
}

/// Owns the engine and drives its event loop.
struct ReactorExecutor {
    reactor: Box<dyn Reactor>,
    dispatcher: ReactorDispatcher,
}

impl ReactorExecutor {
    fn new(reactor: Box<dyn Reactor>, dispatcher: ReactorDispatcher) -> Self {
        Self {
            reactor,
            dispatcher,
        }
    }

    fn drain_work_queue(&self) {
        loop {
            // never hold the queue lock while running work, work may enqueue more work
            let work = self.dispatcher.shared.work_queue.lock().pop_front();
            let work = match work {
                Some(work) => work,
                None => break,
            };
            if catch_unwind(AssertUnwindSafe(work)).is_err() {
                error!(
                    "work panicked on reactor of connection {}",
                    self.dispatcher.connection_id()
                );
            }
        }
    }

    async fn run_until_shutdown(mut self) {
        let shared = self.dispatcher.shared.clone();
        trace!("starts up reactor of connection {}", shared.connection_id);

        let signal = loop {
            if shared.close_requested.load(Ordering::Acquire) {
                break ShutdownSignal::new(true, false, "connection closed by client");
            }
            tokio::select! {
                biased;

                _ = shared.wakeup.notified() => {
                    self.drain_work_queue();
                }
                res = self.reactor.process() => {
                    match res {
                        Ok(true) => {}
                        Ok(false) => {
                            break ShutdownSignal::new(false, false, "reactor stopped");
                        }
                        Err(err) => {
                            error!(
                                "reactor of connection {} failed, cause: {}",
                                shared.connection_id, err
                            );
                            break ShutdownSignal::new(
                                false,
                                true,
                                &format!("reactor I/O failure: {}", err),
                            );
                        }
                    }
                }
            }
        };

        // stop accepting work, and give queued close operations a last chance to run
        {
            let _queue = shared.work_queue.lock();
            shared.is_closed.store(true, Ordering::Release);
        }
        self.drain_work_queue();
        self.reactor.stop();
        self.dispatcher.emit_shutdown(signal);

        info!("shutdown reactor of connection {}!", shared.connection_id);
    }
}
