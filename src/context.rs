//! The explicitly constructed application context.
//!
//! [`AppContext`] owns the queues, the timer thread, the scheduler and the
//! saved-search service, and hands each of them the collaborators it needs.
//! There is one per process; nothing in the crate reaches for global state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::events::{EventHub, SubscriptionEvent};
use crate::model::{Subscription, SubscriptionId, SubscriptionPrefs};
use crate::ports::{
    CredentialsProvider, FeedPersistence, FeedSource, FeedViewOpener, IconSource,
    SavedSearchStore, SearchIndex, SubscriptionStore, TokenStore,
};
use crate::reload::{ReloadServices, Reloader};
use crate::scheduler::{BindingChange, ReloadScheduler, SchedulerTuning};
use crate::search::{RecomputeDelays, SavedSearchService};
use crate::settings::Settings;
use crate::task::{ProgressSink, TaskQueue, TaskRegistry};
use crate::timer::Timers;

/// Process-wide "we are shutting down" flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Everything the engine is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub events: Arc<EventHub>,
    pub source: Arc<dyn FeedSource>,
    pub icons: Arc<dyn IconSource>,
    pub tokens: Arc<dyn TokenStore>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub persistence: Arc<dyn FeedPersistence>,
    pub index: Arc<dyn SearchIndex>,
    pub searches: Arc<dyn SavedSearchStore>,
    pub opener: Arc<dyn FeedViewOpener>,
    /// Aggregated reload progress; `None` disables reporting.
    pub progress: Option<Arc<dyn ProgressSink>>,
}

/// Fine-grained timing, overridable in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineTuning {
    pub scheduler: SchedulerTuning,
    pub recompute: RecomputeDelays,
}

/// What [`AppContext::startup`] set in motion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupSummary {
    pub scheduled: usize,
    pub reloading: usize,
    pub opened: usize,
}

pub struct AppContext {
    settings: Settings,
    events: Arc<EventHub>,
    registry: Arc<TaskRegistry>,
    timers: Timers,
    reloader: Reloader,
    scheduler: ReloadScheduler,
    saved_searches: SavedSearchService,
    subscriptions: Arc<dyn SubscriptionStore>,
    opener: Arc<dyn FeedViewOpener>,
    shutdown: ShutdownFlag,
}

impl AppContext {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Result<Self> {
        Self::with_tuning(settings, collaborators, EngineTuning::default())
    }

    pub fn with_tuning(settings: Settings, collaborators: Collaborators, tuning: EngineTuning) -> Result<Self> {
        let Collaborators {
            events,
            source,
            icons,
            tokens,
            credentials,
            subscriptions,
            persistence,
            index,
            searches,
            opener,
            progress,
        } = collaborators;

        let registry = Arc::new(TaskRegistry::new());
        let timers = Timers::new("livescroll").context("start timer thread")?;
        let shutdown = ShutdownFlag::default();

        let mut reloads = TaskQueue::builder("Updating Feeds")
            .max_concurrent(settings.max_concurrent_reload_jobs)
            .registry(Arc::clone(&registry));
        if let Some(sink) = progress {
            reloads = reloads.progress(sink, settings.progress_delay);
        }
        let saves = TaskQueue::builder("Saving Feeds")
            .max_concurrent(1)
            .registry(Arc::clone(&registry))
            .build();

        let reloader = Reloader::new(
            ReloadServices {
                source,
                icons,
                tokens,
                credentials,
                subscriptions: Arc::clone(&subscriptions),
                persistence,
            },
            reloads.build(),
            saves,
            shutdown.clone(),
            Arc::clone(&events),
            settings.connection_timeout,
        );

        let scheduler = ReloadScheduler::new(
            timers.clone(),
            reloader.clone(),
            Arc::clone(&subscriptions),
            shutdown.clone(),
            tuning.scheduler,
        );
        scheduler.attach(&events);

        let saved_searches =
            SavedSearchService::new(index, searches, Arc::clone(&events), timers.clone(), tuning.recompute);
        saved_searches.attach();

        debug!(
            max_concurrent = settings.max_concurrent_reload_jobs,
            timeout = ?settings.connection_timeout,
            "engine assembled"
        );
        Ok(Self {
            settings,
            events,
            registry,
            timers,
            reloader,
            scheduler,
            saved_searches,
            subscriptions,
            opener,
            shutdown,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn reloader(&self) -> &Reloader {
        &self.reloader
    }

    pub fn scheduler(&self) -> &ReloadScheduler {
        &self.scheduler
    }

    pub fn saved_searches(&self) -> &SavedSearchService {
        &self.saved_searches
    }

    /// The shared timer thread, for callers that debounce their own work.
    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Bind timers, queue startup reloads, open startup views and run the
    /// first saved-search pass.
    pub fn startup(&self) -> StartupSummary {
        let all = self.subscriptions.all();
        let mut scheduled = 0;
        for sub in all.iter().filter(|sub| sub.prefs.auto_update) {
            if self.scheduler.install(sub) != BindingChange::Unchanged {
                scheduled += 1;
            }
        }

        let startup_ids: Vec<SubscriptionId> = all
            .iter()
            .filter(|sub| sub.prefs.reload_on_startup)
            .map(|sub| sub.id)
            .collect();
        let reloading = if startup_ids.is_empty() {
            0
        } else {
            self.reloader.reload(&startup_ids)
        };

        let to_open: Vec<Subscription> = all
            .into_iter()
            .filter(|sub| sub.prefs.open_on_startup)
            .take(self.settings.max_open_on_startup)
            .collect();
        if !to_open.is_empty() {
            self.opener.open(&to_open);
        }

        self.saved_searches.update_all(false);

        let summary = StartupSummary {
            scheduled,
            reloading,
            opened: to_open.len(),
        };
        info!(
            scheduled = summary.scheduled,
            reloading = summary.reloading,
            opened = summary.opened,
            "startup complete"
        );
        summary
    }

    /// Persist new preferences and let the scheduler follow them.
    pub fn update_prefs(&self, id: SubscriptionId, prefs: SubscriptionPrefs) -> Result<()> {
        let mut sub = self
            .subscriptions
            .get(id)
            .with_context(|| format!("subscription {id} does not exist"))?;
        sub.prefs = prefs.clone();
        self.subscriptions.update(&sub)?;
        self.events
            .subscriptions
            .publish(&SubscriptionEvent::PrefsChanged { id, prefs });
        Ok(())
    }

    /// Remove a subscription.  Returns `false` if it did not exist.
    pub fn delete_subscription(&self, id: SubscriptionId) -> bool {
        if self.subscriptions.remove(id).is_none() {
            return false;
        }
        self.events.subscriptions.publish(&SubscriptionEvent::Deleted(id));
        true
    }

    /// Wait until no reload or save is pending or running.  Returns `false`
    /// on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reloader.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Stop everything.  Running reloads are abandoned, pending saves are
    /// dropped, and the call returns once the running save has finished.
    pub fn shutdown(&self) {
        self.shutdown.set();
        self.reloader.reload_queue().cancel(false);
        self.saved_searches.seal(false);
        self.scheduler.shutdown();
        self.reloader.save_queue().cancel(true);
        let leftover = self.registry.cancel_all();
        self.timers.shutdown();
        info!(leftover, "engine stopped");
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if !self.shutdown.is_set() {
            self.shutdown();
        }
    }
}
