//! The reload pipeline.
//!
//! One [`ReloadTask`] per subscription runs on the shared reload queue:
//!
//! ```text
//!  tokens ─► credentials ─► fetch ─┬─ not modified ───────────────► done
//!                                  ├─ fetched ─► icon? ─► SaveTask ─► save queue
//!                                  ├─ login required ─► auth (serialized)
//!                                  └─ failed ─► error flag
//! ```
//!
//! Every stage re-checks the shutdown flag and the task's [`Monitor`].  A
//! run that has announced [`LoadEvent::AboutToLoad`] always announces the
//! matching [`LoadEvent::DoneLoading`], whatever the outcome.
//!
//! Writes never happen on reload workers: fetched feeds are handed to the
//! single-slot save queue so merges into storage are strictly sequential.

mod auth;
mod save;
mod session;

pub use session::{ReloadSession, TokenUpdate};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::context::ShutdownFlag;
use crate::error::ReloadError;
use crate::events::{EventHub, LoadEvent, SubscriptionEvent};
use crate::model::{ParsedFeed, Subscription, SubscriptionId};
use crate::ports::{CredentialsProvider, FeedPersistence, SubscriptionStore, TokenStore};
use crate::source::{FeedSource, FetchOutcome, FetchRequest, IconSource};
use crate::task::{Monitor, Priority, Task, TaskQueue, TaskStatus};

use save::{SaveJob, SaveTask};

/// Collaborators the pipeline calls into.
#[derive(Clone)]
pub struct ReloadServices {
    pub source: Arc<dyn FeedSource>,
    pub icons: Arc<dyn IconSource>,
    pub tokens: Arc<dyn TokenStore>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub persistence: Arc<dyn FeedPersistence>,
}

/// Terminal state of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Fetched and handed to the save queue.
    Saving { items: usize },
    NotModified,
    Cancelled,
    /// The subscription no longer exists.
    Missing,
    /// A login is now available; the reload was queued again.
    LoginRetry,
    LoginDeclined,
    Failed(ReloadError),
}

pub(crate) struct ReloaderInner {
    services: ReloadServices,
    reload_queue: TaskQueue,
    save_queue: TaskQueue,
    shutdown: ShutdownFlag,
    events: Arc<EventHub>,
    /// At most one login prompt at a time, across all reloads.
    login: Mutex<()>,
    timeout: Duration,
    save_seq: AtomicU64,
}

/// Entry point for queueing reloads.
#[derive(Clone)]
pub struct Reloader {
    inner: Arc<ReloaderInner>,
}

impl Reloader {
    pub fn new(
        services: ReloadServices,
        reload_queue: TaskQueue,
        save_queue: TaskQueue,
        shutdown: ShutdownFlag,
        events: Arc<EventHub>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ReloaderInner {
                services,
                reload_queue,
                save_queue,
                shutdown,
                events,
                login: Mutex::new(()),
                timeout,
                save_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Queue reloads for `ids`.  A single subscription is treated as an
    /// interactive refresh and jumps ahead of pending work.
    ///
    /// Returns how many reloads were actually queued; ids that are already
    /// pending or unknown are skipped.
    pub fn reload(&self, ids: &[SubscriptionId]) -> usize {
        let priority = if ids.len() == 1 {
            Priority::Short
        } else {
            Priority::Default
        };
        self.reload_with_priority(ids, priority)
    }

    pub fn reload_with_priority(&self, ids: &[SubscriptionId], priority: Priority) -> usize {
        let inner = &self.inner;
        if inner.shutdown.is_set() {
            return 0;
        }
        let tasks: Vec<Arc<dyn Task>> = ids
            .iter()
            .filter_map(|id| inner.services.subscriptions.get(*id))
            .map(|sub| inner.task(&sub, priority))
            .collect();
        inner.reload_queue.submit(tasks)
    }

    pub fn is_queued(&self, id: SubscriptionId) -> bool {
        self.inner.reload_queue.is_queued(&task_key(id))
    }

    /// Run the pipeline for `id` on the calling thread.
    pub fn run(&self, id: SubscriptionId, monitor: &Monitor) -> ReloadOutcome {
        self.inner.run(id, monitor)
    }

    pub fn reload_queue(&self) -> &TaskQueue {
        &self.inner.reload_queue
    }

    pub fn save_queue(&self) -> &TaskQueue {
        &self.inner.save_queue
    }

    /// No reload or save is pending or running.
    pub fn is_idle(&self) -> bool {
        self.inner.reload_queue.is_empty() && self.inner.save_queue.is_empty()
    }
}

fn task_key(id: SubscriptionId) -> String {
    format!("reload:{}", id.0)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Publishes `DoneLoading` when dropped.
struct LoadingGuard<'a> {
    events: &'a EventHub,
    id: SubscriptionId,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.events.loads.publish(&LoadEvent::DoneLoading(self.id));
    }
}

impl ReloaderInner {
    fn task(self: &Arc<Self>, subscription: &Subscription, priority: Priority) -> Arc<dyn Task> {
        Arc::new(ReloadTask {
            key: task_key(subscription.id),
            id: subscription.id,
            name: subscription.name.clone(),
            priority,
            reloader: Arc::clone(self),
        })
    }

    fn should_stop(&self, monitor: &Monitor) -> bool {
        self.shutdown.is_set() || monitor.is_cancelled()
    }

    fn run(self: &Arc<Self>, id: SubscriptionId, monitor: &Monitor) -> ReloadOutcome {
        if self.should_stop(monitor) {
            return ReloadOutcome::Cancelled;
        }
        let Some(subscription) = self.services.subscriptions.get(id) else {
            debug!(subscription = %id, "subscription vanished before reload");
            return ReloadOutcome::Missing;
        };

        self.events.loads.publish(&LoadEvent::AboutToLoad(id));
        let _loading = LoadingGuard {
            events: &self.events,
            id,
        };

        let outcome = self.pipeline(subscription, monitor);
        match &outcome {
            ReloadOutcome::Saving { .. } | ReloadOutcome::NotModified => {
                self.set_error(id, false, None);
            }
            ReloadOutcome::Failed(err) => self.set_error(id, true, Some(err.short_message())),
            _ => {}
        }
        outcome
    }

    fn pipeline(self: &Arc<Self>, subscription: Subscription, monitor: &Monitor) -> ReloadOutcome {
        let services = &self.services;
        let tokens = services.tokens.load(&subscription.address);
        let realm = subscription.realm.clone();
        let mut session = ReloadSession::new(subscription, tokens, None);
        session.credentials = services
            .credentials
            .credentials(&session.normalized, realm.as_deref());
        if self.should_stop(monitor) {
            return ReloadOutcome::Cancelled;
        }

        monitor.set_subtask(session.subscription.name.clone());
        let request = FetchRequest {
            address: &session.subscription.address,
            tokens: session.tokens.as_ref(),
            credentials: session.credentials.as_ref(),
            timeout: self.timeout,
        };
        let result = services.source.fetch(&request);
        if self.should_stop(monitor) {
            return ReloadOutcome::Cancelled;
        }

        match result {
            Ok(FetchOutcome::NotModified) => {
                debug!(subscription = %session.subscription.id, "not modified");
                ReloadOutcome::NotModified
            }
            Ok(FetchOutcome::Fetched { feed, tokens }) => self.interpret(session, feed, tokens, monitor),
            Err(ReloadError::AuthenticationRequired { realm }) => {
                self.authenticate(&session, realm, monitor)
            }
            Err(ReloadError::Cancelled) => ReloadOutcome::Cancelled,
            Err(err @ ReloadError::Parse(_)) => {
                // The address may point at a website rather than a feed;
                // its icon is still worth having.
                let sub = session.subscription;
                if let Some(icon) = self.fallback_icon(&sub, &sub.address) {
                    self.enqueue_save(SaveJob {
                        subscription: sub,
                        feed: None,
                        tokens: TokenUpdate::Keep,
                        icon: Some(icon),
                    });
                }
                ReloadOutcome::Failed(err)
            }
            Err(err) => ReloadOutcome::Failed(err),
        }
    }

    fn interpret(
        self: &Arc<Self>,
        session: ReloadSession,
        feed: ParsedFeed,
        fresh: Option<crate::model::ConditionalTokens>,
        monitor: &Monitor,
    ) -> ReloadOutcome {
        let tokens = TokenUpdate::decide(session.tokens.as_ref(), fresh);
        let sub = session.subscription;
        let icon_from = feed.homepage.clone().unwrap_or_else(|| sub.address.clone());
        let icon = self.fallback_icon(&sub, &icon_from);
        if self.should_stop(monitor) {
            return ReloadOutcome::Cancelled;
        }

        let items = feed.items.len();
        self.enqueue_save(SaveJob {
            subscription: sub,
            feed: Some(feed),
            tokens,
            icon,
        });
        ReloadOutcome::Saving { items }
    }

    /// Best effort; a subscription that already has an icon is skipped.
    fn fallback_icon(&self, subscription: &Subscription, address: &str) -> Option<Vec<u8>> {
        if self.shutdown.is_set() || self.services.persistence.has_icon(subscription.id) {
            return None;
        }
        match self.services.icons.fetch_icon(address, self.timeout) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(subscription = %subscription.id, error = %e, "no icon");
                None
            }
        }
    }

    fn enqueue_save(self: &Arc<Self>, job: SaveJob) {
        let seq = self.save_seq.fetch_add(1, Ordering::Relaxed);
        let task = SaveTask::new(seq, job, Arc::clone(self));
        self.save_queue.submit([Arc::new(task) as Arc<dyn Task>]);
    }

    /// Update the error indicator; listeners hear only about flag flips.
    fn set_error(&self, id: SubscriptionId, error: bool, message: Option<String>) {
        let subscriptions = &self.services.subscriptions;
        let Some(mut sub) = subscriptions.get(id) else {
            return;
        };
        if sub.error == error && sub.error_message == message {
            return;
        }
        let flipped = sub.error != error;
        sub.error = error;
        sub.error_message = message;
        if let Err(e) = subscriptions.update(&sub) {
            warn!(subscription = %id, error = %e, "could not record reload state");
            return;
        }
        if flipped {
            self.events
                .subscriptions
                .publish(&SubscriptionEvent::ErrorChanged { id, error });
        }
    }
}

struct ReloadTask {
    key: String,
    id: SubscriptionId,
    name: String,
    priority: Priority,
    reloader: Arc<ReloaderInner>,
}

impl Task for ReloadTask {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn run(&self, monitor: &Monitor) -> TaskStatus {
        match self.reloader.run(self.id, monitor) {
            ReloadOutcome::Cancelled => TaskStatus::Cancelled,
            ReloadOutcome::Failed(err) => TaskStatus::Error(err),
            _ => TaskStatus::Ok,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
