//! Shared test doubles for the reload pipeline, the scheduler and the app
//! context tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::ShutdownFlag;
use crate::error::ReloadError;
use crate::events::EventHub;
use crate::model::{normalize_address, Credentials, ParsedFeed, Subscription, SubscriptionId};
use crate::ports::CredentialsProvider;
use crate::reload::{ReloadServices, Reloader};
use crate::source::{FeedItem, FeedSource, FetchOutcome, FetchRequest, IconSource};
use crate::store::MemoryStore;
use crate::task::TaskQueue;

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

pub fn feed_with(items: Vec<FeedItem>) -> ParsedFeed {
    ParsedFeed {
        title: "Test feed".into(),
        homepage: None,
        items,
    }
}

/// A feed source answering through a closure and counting calls.
pub struct FnSource<F> {
    respond: F,
    calls: AtomicUsize,
}

impl<F> FnSource<F>
where
    F: Fn(&FetchRequest<'_>) -> Result<FetchOutcome, ReloadError> + Send + Sync,
{
    pub fn new(respond: F) -> Arc<Self> {
        Arc::new(Self {
            respond,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> FeedSource for FnSource<F>
where
    F: Fn(&FetchRequest<'_>) -> Result<FetchOutcome, ReloadError> + Send + Sync,
{
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome, ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request)
    }
}

/// Serves the same icon for every address and records the requests.
#[derive(Default)]
pub struct StaticIcon {
    requests: Mutex<Vec<String>>,
}

impl StaticIcon {
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl IconSource for StaticIcon {
    fn fetch_icon(&self, address: &str, _timeout: Duration) -> anyhow::Result<Vec<u8>> {
        self.requests.lock().unwrap().push(address.to_string());
        Ok(vec![0, 0, 1, 0])
    }
}

/// Credentials double.  Declines prompts unless told to accept.
#[derive(Default)]
pub struct LoginDesk {
    known: Mutex<HashMap<(String, Option<String>), Credentials>>,
    accept: Mutex<Option<(Credentials, Duration)>>,
    prompts: AtomicUsize,
}

impl LoginDesk {
    /// Accept every prompt with `credentials` after `think` time.
    pub fn accept_with(&self, credentials: Credentials, think: Duration) {
        *self.accept.lock().unwrap() = Some((credentials, think));
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

impl CredentialsProvider for LoginDesk {
    fn credentials(&self, normalized_address: &str, realm: Option<&str>) -> Option<Credentials> {
        self.known
            .lock()
            .unwrap()
            .get(&(normalized_address.to_string(), realm.map(String::from)))
            .cloned()
    }

    fn prompt_login(&self, address: &str, realm: Option<&str>) -> Option<Credentials> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let (credentials, think) = self.accept.lock().unwrap().clone()?;
        thread::sleep(think);
        self.known.lock().unwrap().insert(
            (normalize_address(address), realm.map(String::from)),
            credentials.clone(),
        );
        Some(credentials)
    }
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub events: Arc<EventHub>,
    pub reloader: Reloader,
    pub shutdown: ShutdownFlag,
    pub icons: Arc<StaticIcon>,
    pub desk: Arc<LoginDesk>,
    /// Subscription #1, already stored.
    pub sub: Subscription,
}

/// A reloader over a [`MemoryStore`] holding one subscription.
pub fn fixture(source: Arc<dyn FeedSource>, max_concurrent: usize) -> Fixture {
    let events = EventHub::new();
    let store = Arc::new(MemoryStore::new(Arc::clone(&events)));
    let sub = Subscription::new(SubscriptionId(1), "Example", "https://feeds.example.com/rss");
    store.insert_subscription(sub.clone());

    let icons = Arc::new(StaticIcon::default());
    let desk = Arc::new(LoginDesk::default());
    let shutdown = ShutdownFlag::default();
    let services = ReloadServices {
        source,
        icons: icons.clone(),
        tokens: store.clone(),
        credentials: desk.clone(),
        subscriptions: store.clone(),
        persistence: store.clone(),
    };
    let reloader = Reloader::new(
        services,
        TaskQueue::new("test reloads", max_concurrent),
        TaskQueue::new("test saves", 1),
        shutdown.clone(),
        Arc::clone(&events),
        Duration::from_secs(1),
    );
    Fixture {
        store,
        events,
        reloader,
        shutdown,
        icons,
        desk,
        sub,
    }
}
