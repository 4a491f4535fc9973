//! Flow-control credit accounting of a receive link.
//!
//! An accounting object is created when a link becomes active and is updated exactly once
//! per drain iteration of the [`MessageFlux`] that owns the link. It is not safe to call
//! `update` from anywhere else.
//!
//! [`MessageFlux`]: crate::flux::MessageFlux
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{error::Error, receiver::ReceiveLink, Result};

/// Prefetch used instead of `u32::MAX`, which would overflow credit arithmetic.
const MAX_PREFETCH_CLAMP: u32 = 100;
/// Demand used instead of an unbounded request. Link credit has no notion of infinity.
const UNBOUNDED_REQUEST_CLAMP: u64 = 1;

/// Strategy used to replenish link credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditFlowMode {
    /// Credit follows what was emitted downstream.
    EmissionDriven,
    /// Credit follows what downstream requested.
    RequestDriven,
}

pub trait CreditAccounting: Send {
    /// `requested` is the outstanding downstream demand, `emitted` the number of messages the
    /// last drain iteration emitted.
    fn update(&mut self, requested: u64, emitted: u64);
}

fn clamp_prefetch(prefetch: u32) -> u32 {
    if prefetch == u32::MAX {
        MAX_PREFETCH_CLAMP
    } else {
        prefetch
    }
}

fn request_credits(link: &dyn ReceiveLink, credits: u64) {
    let credits = u32::try_from(credits).unwrap_or(u32::MAX);
    if let Err(err) = link.add_credits(credits) {
        // the link may already be closing
        warn!(
            "failed to add {} credits to link {}, cause: {}.",
            credits,
            link.link_name(),
            err
        );
    }
}

/// Creates the accounting for a link that just became active.
///
/// `upstream` gates how many messages the link pump may take from the link, it is only
/// used in request-driven mode.
pub(crate) fn create_accounting(
    mode: CreditFlowMode,
    link: Arc<dyn ReceiveLink>,
    prefetch: u32,
    upstream: Arc<Semaphore>,
) -> Result<Box<dyn CreditAccounting>> {
    match mode {
        CreditFlowMode::EmissionDriven => {
            Ok(Box::new(EmissionDrivenCreditAccounting::new(link, prefetch)?))
        }
        CreditFlowMode::RequestDriven => Ok(Box::new(RequestDrivenCreditAccounting::new(
            link, prefetch, upstream,
        )?)),
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Replenishes credit once half of the prefetch has been emitted downstream.
pub struct EmissionDrivenCreditAccounting {
    link: Arc<dyn ReceiveLink>,
    prefetch: u64,
    threshold: u64,
    accumulated: u64,
    initialized: bool,
}

impl EmissionDrivenCreditAccounting {
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `prefetch` is 0.
    pub fn new(link: Arc<dyn ReceiveLink>, prefetch: u32) -> Result<Self> {
        if prefetch == 0 {
            return Err(Error::InvalidArgument(
                "prefetch must be greater than 0 for emission driven credit flow".to_string(),
            ));
        }
        let prefetch = u64::from(clamp_prefetch(prefetch));
        Ok(Self {
            link,
            prefetch,
            threshold: (prefetch + 1) / 2,
            accumulated: 0,
            initialized: false,
        })
    }
}

impl CreditAccounting for EmissionDrivenCreditAccounting {
    fn update(&mut self, _requested: u64, emitted: u64) {
        if !self.initialized {
            if emitted == 0 {
                self.initialized = true;
                debug!(
                    "initial credit {} for link {}",
                    self.prefetch,
                    self.link.link_name()
                );
                request_credits(self.link.as_ref(), self.prefetch);
            }
            return;
        }
        self.accumulated += emitted;
        if self.accumulated >= self.threshold {
            let credits = self.accumulated;
            self.accumulated = 0;
            request_credits(self.link.as_ref(), credits);
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Requests messages from the link pump to match downstream demand, and grants credit once
/// a prefetch worth of messages has been requested.
pub struct RequestDrivenCreditAccounting {
    link: Arc<dyn ReceiveLink>,
    upstream: Arc<Semaphore>,
    prefetch: u64,
    /// Messages requested from upstream and not yet emitted.
    pending_message_count: u64,
    accumulated: u64,
    unbounded: bool,
}

impl RequestDrivenCreditAccounting {
    /// A `prefetch` of 0 is allowed, credit then follows demand one to one.
    pub fn new(link: Arc<dyn ReceiveLink>, prefetch: u32, upstream: Arc<Semaphore>) -> Result<Self> {
        Ok(Self {
            link,
            upstream,
            prefetch: u64::from(clamp_prefetch(prefetch)),
            pending_message_count: 0,
            accumulated: 0,
            unbounded: false,
        })
    }

    pub(crate) fn pending_message_count(&self) -> u64 {
        self.pending_message_count
    }
}

impl CreditAccounting for RequestDrivenCreditAccounting {
    fn update(&mut self, requested: u64, emitted: u64) {
        if requested == u64::MAX {
            self.unbounded = true;
        }
        let requested = if self.unbounded {
            UNBOUNDED_REQUEST_CLAMP
        } else {
            requested
        };
        self.pending_message_count = self.pending_message_count.saturating_sub(emitted);

        let needed = requested
            .saturating_add(self.prefetch)
            .saturating_sub(self.pending_message_count);
        if needed == 0 {
            return;
        }
        self.pending_message_count += needed;
        let permits = usize::try_from(needed).unwrap_or(Semaphore::MAX_PERMITS);
        self.upstream
            .add_permits(permits.min(Semaphore::MAX_PERMITS - self.upstream.available_permits()));

        self.accumulated += needed;
        if self.accumulated >= self.prefetch {
            let credits = self.accumulated;
            self.accumulated = 0;
            request_credits(self.link.as_ref(), credits);
        }
    }
}
