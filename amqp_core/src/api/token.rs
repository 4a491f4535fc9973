//! Proactive renewal of the token authorizing a link.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{cbs::ClaimsBasedSecurity, error::Error, Result};

/// Refresh when this share of the token lifetime has passed.
const REFRESH_RATIO: f64 = 0.9;
/// Lower bound of the refresh interval, for tokens that are about to expire.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of an authorization, replayed to late observers.
#[derive(Debug, Clone)]
pub enum AuthorizationResult {
    /// Token put, valid until the given time.
    Authorized(SystemTime),
    /// Token could not be renewed, the link must not be used anymore.
    Failed(Error),
}

/// Authorizes one audience and keeps the authorization fresh.
pub struct TokenManager {
    cbs: Arc<dyn ClaimsBasedSecurity>,
    audience: String,
    scopes: Vec<String>,
    results_tx: Mutex<Option<watch::Sender<Option<AuthorizationResult>>>>,
    /// Delay of the last successful authorization, reused when a refresh fails transiently.
    last_refresh_interval: Mutex<Option<Duration>>,
    is_scheduled: AtomicBool,
    is_closed: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("audience", &self.audience)
            .field("is_scheduled", &self.is_scheduled.load(Ordering::Relaxed))
            .field("is_closed", &self.is_closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TokenManager {
    pub fn new(cbs: Arc<dyn ClaimsBasedSecurity>, audience: &str, scopes: Vec<String>) -> Arc<Self> {
        let (results_tx, _) = watch::channel(None);
        Arc::new(Self {
            cbs,
            audience: audience.to_owned(),
            scopes,
            results_tx: Mutex::new(Some(results_tx)),
            last_refresh_interval: Mutex::new(None),
            is_scheduled: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Puts a token for the audience. The first success schedules the refresh loop.
    ///
    /// # Errors
    ///
    /// Returns the error of the put-token exchange, or `IllegalState` if the manager is closed.
    pub async fn authorize(self: &Arc<Self>) -> Result<SystemTime> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(Error::IllegalState(format!(
                "token manager of {} is closed",
                self.audience
            )));
        }
        let expires_on = self.cbs.authorize(&self.audience, &self.scopes).await?;
        let interval = refresh_interval(expires_on);
        *self.last_refresh_interval.lock() = Some(interval);
        self.publish(AuthorizationResult::Authorized(expires_on));

        if !self.is_scheduled.swap(true, Ordering::AcqRel) {
            debug!(
                "schedule token refresh of {} in {:?}",
                self.audience, interval
            );
            tokio::spawn(self.clone().run_refresh_loop(interval));
        }
        Ok(expires_on)
    }

    /// Authorization results, starting with the latest one.
    pub fn authorization_results(&self) -> watch::Receiver<Option<AuthorizationResult>> {
        match *self.results_tx.lock() {
            Some(ref tx) => tx.subscribe(),
            None => {
                // closed, hand out a completed stream
                let (_, rx) = watch::channel(None);
                rx
            }
        }
    }

    /// Stops refreshing and completes the result stream. Idempotent.
    pub fn close(&self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("close token manager of {}", self.audience);
        self.cancel.cancel();
        self.results_tx.lock().take();
    }

    fn publish(&self, result: AuthorizationResult) {
        if let Some(ref tx) = *self.results_tx.lock() {
            tx.send_replace(Some(result));
        }
    }

    async fn run_refresh_loop(self: Arc<Self>, mut delay: Duration) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
            let res = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = self.cbs.authorize(&self.audience, &self.scopes) => res,
            };
            match res {
                Ok(expires_on) => {
                    delay = refresh_interval(expires_on);
                    *self.last_refresh_interval.lock() = Some(delay);
                    debug!("token of {} refreshed, next refresh in {:?}", self.audience, delay);
                    self.publish(AuthorizationResult::Authorized(expires_on));
                }
                Err(err) if err.is_transient() => {
                    delay = self.last_refresh_interval.lock().unwrap_or(MIN_REFRESH_INTERVAL);
                    warn!(
                        "failed to refresh token of {}, retry in {:?}, cause: {}.",
                        self.audience, delay, err
                    );
                }
                Err(err) => {
                    error!(
                        "failed to refresh token of {}, stop refreshing, cause: {}.",
                        self.audience, err
                    );
                    self.publish(AuthorizationResult::Failed(err));
                    self.is_scheduled.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}

fn refresh_interval(expires_on: SystemTime) -> Duration {
    let remaining = expires_on
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    remaining.mul_f64(REFRESH_RATIO).max(MIN_REFRESH_INTERVAL)
}

/////////////////////////////////////////////////////////////////////////////
/// Builds the token manager of each link.
#[derive(Debug, Clone)]
pub struct TokenManagerProvider {
    fully_qualified_namespace: String,
    authorization_scope: String,
}

impl TokenManagerProvider {
    pub fn new(fully_qualified_namespace: &str, authorization_scope: &str) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.to_owned(),
            authorization_scope: authorization_scope.to_owned(),
        }
    }

    /// Audience of `entity_path`, e.g. `amqp://contoso.servicebus.windows.net/queue-1`.
    pub fn audience(&self, entity_path: &str) -> String {
        format!("amqp://{}/{}", self.fully_qualified_namespace, entity_path)
    }

    pub fn token_manager(&self, cbs: Arc<dyn ClaimsBasedSecurity>, entity_path: &str) -> Arc<TokenManager> {
        TokenManager::new(
            cbs,
            &self.audience(entity_path),
            vec![self.authorization_scope.clone()],
        )
    }
}
