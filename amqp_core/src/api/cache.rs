//! Cache of a single recoverable resource.
//!
//! The cache hands out the current resource while it is alive, and transparently creates
//! a replacement once the resource reports itself disposed. Creation waits for the resource
//! to become active, retrying timeouts and transient errors for as long as a caller waits.
use std::{fmt, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{error::Error, retry::RetryPolicy, Result};

/// A resource with an endpoint lifecycle.
#[async_trait]
pub trait RecoverableResource: Send + Sync + 'static {
    fn resource_id(&self) -> &str;

    /// `true` once the resource can no longer be used.
    fn is_disposed(&self) -> bool;

    /// Resolves once the resource is active.
    async fn wait_for_active(&self) -> Result<()>;

    async fn close(&self);
}

pub type ResourceFuture<T> = Pin<Box<dyn Future<Output = Result<Arc<T>>> + Send + 'static>>;

/// Creates a resource that is not active yet.
pub type ResourceSupplier<T> = Box<dyn Fn() -> ResourceFuture<T> + Send + Sync + 'static>;

struct CacheState<T> {
    is_terminated: bool,
    current: Option<Arc<T>>,
}

pub struct ResourceCache<T: RecoverableResource> {
    name: String,
    supplier: ResourceSupplier<T>,
    retry_policy: Arc<dyn RetryPolicy>,
    /// Guards the terminated flag and the cached resource together.
    state: Mutex<CacheState<T>>,
    /// Serializes creation, waiters queued behind a creation reuse its result.
    creation: tokio::sync::Mutex<()>,
    terminated: CancellationToken,
}

impl<T: RecoverableResource> fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResourceCache")
            .field("name", &self.name)
            .field("is_terminated", &state.is_terminated)
            .field(
                "current",
                &state.current.as_ref().map(|r| r.resource_id().to_owned()),
            )
            .finish()
    }
}

impl<T: RecoverableResource> ResourceCache<T> {
    pub fn new(name: &str, supplier: ResourceSupplier<T>, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            name: name.to_owned(),
            supplier,
            retry_policy,
            state: Mutex::new(CacheState {
                is_terminated: false,
                current: None,
            }),
            creation: tokio::sync::Mutex::new(()),
            terminated: CancellationToken::new(),
        }
    }

    /// Returns the active resource, creating one if there is none or the cached one is disposed.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryTerminated` once the cache is disposed, or the first error of creation
    /// that is not retried.
    pub async fn get(&self) -> Result<Arc<T>> {
        if let Some(resource) = self.current_active()? {
            return Ok(resource);
        }
        let _creation = tokio::select! {
            _ = self.terminated.cancelled() => return Err(self.terminated_error()),
            guard = self.creation.lock() => guard,
        };
        // created by the caller we queued behind
        if let Some(resource) = self.current_active()? {
            return Ok(resource);
        }
        self.create().await
    }

    /// Terminates the cache and closes the cached resource. Returns `true` for the call that
    /// disposed the cache.
    pub async fn dispose(&self) -> bool {
        let current = {
            let mut state = self.state.lock();
            if state.is_terminated {
                return false;
            }
            state.is_terminated = true;
            state.current.take()
        };
        info!("dispose cache {}", self.name);
        // aborts creations in progress, their drop guards close partial resources
        self.terminated.cancel();
        if let Some(resource) = current {
            resource.close().await;
        }
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().is_terminated
    }

    /// `true` if there is no cached resource or it is disposed.
    pub fn is_current_closed(&self) -> bool {
        match self.state.lock().current {
            Some(ref resource) => resource.is_disposed(),
            None => true,
        }
    }

    fn terminated_error(&self) -> Error {
        Error::RecoveryTerminated(format!("cache {} is disposed", self.name))
    }

    fn current_active(&self) -> Result<Option<Arc<T>>> {
        let mut state = self.state.lock();
        if state.is_terminated {
            return Err(self.terminated_error());
        }
        match state.current {
            Some(ref resource) if !resource.is_disposed() => Ok(Some(resource.clone())),
            Some(ref resource) => {
                debug!(
                    "cache {} evicts disposed resource {}",
                    self.name,
                    resource.resource_id()
                );
                state.current = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn create(&self) -> Result<Arc<T>> {
        let mut attempt = 0u32;
        loop {
            let res = tokio::select! {
                _ = self.terminated.cancelled() => return Err(self.terminated_error()),
                res = self.create_once() => res,
            };
            match res {
                Ok(resource) => {
                    let is_cached = {
                        let mut state = self.state.lock();
                        if !state.is_terminated {
                            state.current = Some(resource.clone());
                        }
                        !state.is_terminated
                    };
                    if !is_cached {
                        // disposed while the resource was coming up
                        resource.close().await;
                        return Err(self.terminated_error());
                    }
                    info!(
                        "cache {} created resource {}",
                        self.name,
                        resource.resource_id()
                    );
                    return Ok(resource);
                }
                Err(err) if is_retriable(&err) => {
                    let delay = self
                        .retry_policy
                        .calculate_backoff(attempt.min(self.retry_policy.max_retries()));
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "failed to create resource of cache {}, retry attempt {} after {:?}, cause: {}.",
                        self.name, attempt, delay, err
                    );
                    tokio::select! {
                        _ = self.terminated.cancelled() => return Err(self.terminated_error()),
                        _ = time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    warn!(
                        "failed to create resource of cache {}, cause: {}.",
                        self.name, err
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn create_once(&self) -> Result<Arc<T>> {
        let resource = (self.supplier)().await?;
        let guard = CloseOnDrop::new(resource.clone());
        let try_timeout = self.retry_policy.try_timeout();
        match time::timeout(try_timeout, resource.wait_for_active()).await {
            Ok(Ok(())) => {
                guard.disarm();
                Ok(resource)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Timeout(format!(
                "resource {} of cache {} did not become active within {:?}",
                resource.resource_id(),
                self.name,
                try_timeout
            ))),
        }
    }
}

/// Creation failures worth another attempt, a concurrently torn down resource included.
fn is_retriable(err: &Error) -> bool {
    err.is_transient()
        || matches!(
            err,
            Error::Timeout(_) | Error::IllegalState(_) | Error::Rejected(_)
        )
}

/// Closes a resource that never made it into the cache.
struct CloseOnDrop<T: RecoverableResource> {
    resource: Option<Arc<T>>,
}

impl<T: RecoverableResource> CloseOnDrop<T> {
    fn new(resource: Arc<T>) -> Self {
        Self {
            resource: Some(resource),
        }
    }

    fn disarm(mut self) {
        self.resource = None;
    }
}

impl<T: RecoverableResource> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        let resource = match self.resource.take() {
            Some(resource) => resource,
            None => return,
        };
        debug!("close partially created resource {}", resource.resource_id());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    resource.close().await;
                });
            }
            Err(_) => warn!(
                "failed to close resource {}, cause: no runtime.",
                resource.resource_id()
            ),
        }
    }
}
