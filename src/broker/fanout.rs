//! Fan-out: candidate collection and the three delivery strategies.
//!
//! `direct` sends inline on the publishing task, `pooled` spreads sends
//! over the worker pool and awaits the outcomes, `sticky` pins each
//! client to one worker and returns without waiting. All three append
//! the message to the replay cache exactly once, after every session
//! has had its attempts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::broker::registry::SessionRegistry;
use crate::broker::session::ClientSession;
use crate::config::{DeliveryConfig, DeliveryStrategy, ServerConfig};
use crate::core::cache::ReplayCache;
use crate::core::error::HubError;
use crate::core::message::{encode_message_frame, ClientId, Message};
use crate::dispatch::sticky::StickyRouter;
use crate::dispatch::worker::{Countdown, SendJob, WorkerPool};

/// Sessions a message fans out to right now: receiving, enabled, alive,
/// subscription-matched and admitted by the destination filter.
pub fn collect_candidates(
    registry: &SessionRegistry,
    message: &Message,
) -> Vec<Arc<ClientSession>> {
    registry
        .snapshot()
        .into_iter()
        .filter(|session| {
            session.is_receiving()
                && session.is_enabled()
                && !session.is_closed()
                && session.accepts_destinations(&message.destinations)
                && session.matches(&message.subjects)
        })
        .collect()
}

pub struct Dispatcher {
    strategy: DeliveryStrategy,
    pool: Option<Arc<WorkerPool>>,
    router: Option<Arc<StickyRouter>>,
    max_send_retries: u32,
    retry_interval: Duration,
    cache: Arc<ReplayCache>,
}

impl Dispatcher {
    pub fn new(delivery: &DeliveryConfig, server: &ServerConfig, cache: Arc<ReplayCache>) -> Self {
        let (pool, router) = match delivery.strategy {
            DeliveryStrategy::Direct => (None, None),
            DeliveryStrategy::Pooled => (
                Some(WorkerPool::new(
                    delivery.workers,
                    delivery.queue_capacity,
                    server.max_send_retries,
                    delivery.retry_interval(),
                    None,
                )),
                None,
            ),
            DeliveryStrategy::Sticky => {
                let pool = WorkerPool::new(
                    delivery.workers,
                    delivery.queue_capacity,
                    server.max_send_retries,
                    delivery.retry_interval(),
                    None,
                );
                let router = Arc::new(StickyRouter::new(pool.workers()));
                (Some(pool), Some(router))
            }
        };
        Self {
            strategy: delivery.strategy,
            pool,
            router,
            max_send_retries: server.max_send_retries,
            retry_interval: delivery.retry_interval(),
            cache,
        }
    }

    pub fn strategy(&self) -> DeliveryStrategy {
        self.strategy
    }

    /// Per-worker queue depths, present for the pooled and sticky strategies.
    pub fn queue_depths(&self) -> Option<Vec<usize>> {
        self.pool.as_ref().map(|pool| pool.queue_depths())
    }

    pub fn sticky_bindings(&self) -> usize {
        self.router.as_ref().map_or(0, |router| router.len())
    }

    pub fn evict_idle_bindings(&self, max_idle: Duration) -> usize {
        self.router
            .as_ref()
            .map_or(0, |router| router.evict_idle(max_idle))
    }

    pub fn unbind(&self, client: &ClientId) {
        if let Some(router) = &self.router {
            router.unbind(client);
        }
    }

    /// Fan one message out to `candidates` under the configured strategy.
    ///
    /// The message lands in the replay cache exactly once per call, even
    /// when every delivery fails, so late subscribers can still catch up.
    pub async fn dispatch(
        &self,
        message: Arc<Message>,
        candidates: Vec<Arc<ClientSession>>,
    ) -> Result<(), HubError> {
        let frame = encode_message_frame(&message)?;
        trace!(
            candidates = candidates.len(),
            frame_len = frame.len(),
            strategy = ?self.strategy,
            "dispatching"
        );

        match self.strategy {
            DeliveryStrategy::Direct => {
                let failed = self.send_direct(&frame, candidates).await;
                self.cache.append(message);
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(HubError::RetryExhausted { failed })
                }
            }
            DeliveryStrategy::Pooled => {
                let failed = self.send_pooled(&frame, candidates).await;
                self.cache.append(message);
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(HubError::RetryExhausted { failed })
                }
            }
            DeliveryStrategy::Sticky => {
                self.send_sticky(frame, message, candidates);
                Ok(())
            }
        }
    }

    /// Inline sends with whole-subset retry passes: every session that
    /// failed a pass is retried in the next one, up to the retry budget.
    async fn send_direct(
        &self,
        frame: &Bytes,
        candidates: Vec<Arc<ClientSession>>,
    ) -> Vec<ClientId> {
        let mut pending = candidates;
        for attempt in 0..=self.max_send_retries {
            if pending.is_empty() {
                break;
            }
            if attempt > 0 {
                tokio::time::sleep(self.retry_interval).await;
            }
            let mut failed = Vec::new();
            for session in pending {
                if let Err(err) = session.forward(frame.clone()) {
                    debug!(
                        client = %session.display_label(),
                        attempt,
                        error = %err,
                        "delivery attempt failed"
                    );
                    failed.push(session);
                }
            }
            pending = failed;
        }

        pending
            .into_iter()
            .map(|session| {
                warn!(client = %session.display_label(), "delivery retries exhausted");
                session.sticky_key()
            })
            .collect()
    }

    /// One pool job per session; the workers retry, we await the verdicts.
    async fn send_pooled(
        &self,
        frame: &Bytes,
        candidates: Vec<Arc<ClientSession>>,
    ) -> Vec<ClientId> {
        let Some(pool) = &self.pool else {
            return Vec::new();
        };

        let mut completions = Vec::with_capacity(candidates.len());
        for session in candidates {
            let label = session.sticky_key();
            let (tx, rx) = oneshot::channel();
            pool.submit(SendJob {
                frame: frame.clone(),
                target: session,
                completion: Some(tx),
                countdown: None,
            });
            completions.push((label, rx));
        }

        let (labels, receivers): (Vec<_>, Vec<_>) = completions.into_iter().unzip();
        join_all(receivers)
            .await
            .into_iter()
            .zip(labels)
            .filter_map(|(outcome, label)| match outcome {
                Ok(Ok(())) => None,
                _ => Some(label),
            })
            .collect()
    }

    /// Fire-and-forget: each session's job goes to its pinned worker and
    /// the shared countdown appends to the cache once the last job lands.
    /// Failures surface in worker logs only.
    fn send_sticky(
        &self,
        frame: Bytes,
        message: Arc<Message>,
        candidates: Vec<Arc<ClientSession>>,
    ) {
        let (Some(pool), Some(router)) = (&self.pool, &self.router) else {
            self.cache.append(message);
            return;
        };

        let cache = self.cache.clone();
        let countdown = Countdown::new(candidates.len(), move || cache.append(message));
        let depths = pool.queue_depths();
        for session in candidates {
            let worker = router.select(&session.sticky_key(), &depths);
            pool.submit_to(
                worker,
                SendJob {
                    frame: frame.clone(),
                    target: session,
                    completion: None,
                    countdown: Some(countdown.clone()),
                },
            );
        }
    }

    pub fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }

    /// Handle for joining the workers off the async runtime; `None` for
    /// the direct strategy.
    pub(crate) fn worker_pool(&self) -> Option<Arc<WorkerPool>> {
        self.pool.clone()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("strategy", &self.strategy)
            .field("workers", &self.pool.as_ref().map(|p| p.workers()))
            .finish()
    }
}
