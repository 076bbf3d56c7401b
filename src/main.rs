//! livescroll — a headless, live-updating RSS reader on top of
//! `livescroll-engine`.
//!
//! New and updated items are printed as they are merged, newest first, one
//! line each.  Feeds reload on their own intervals until Ctrl+C.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use livescroll_engine::credentials::TerminalCredentials;
use livescroll_engine::events::EventHub;
use livescroll_engine::model::{NewsState, Subscription, SubscriptionId, SubscriptionPrefs};
use livescroll_engine::ports::{FeedViewOpener, SubscriptionStore};
use livescroll_engine::search::{SavedSearch, SavedSearchId, SearchCondition};
use livescroll_engine::settings::FeedsFile;
use livescroll_engine::source::RssSource;
use livescroll_engine::store::{MemoryStore, StoredNews};
use livescroll_engine::task::{BatchedBuffer, Monitor, ProgressSink};
use livescroll_engine::{AppContext, Collaborators, Settings};

const DEFAULT_FEED: &str = "https://feeds.bbci.co.uk/news/rss.xml";

/// How often the default feed is re-fetched.
const DEFAULT_INTERVAL_SECS: u64 = 60;

const OUTPUT_BATCH: Duration = Duration::from_millis(300);

#[derive(Parser)]
#[command(name = "livescroll", version, about = "A live-updating RSS reader")]
struct Cli {
    /// Feed to follow when no feeds file is given.
    url: Option<String>,

    /// TOML file listing the feeds to follow.
    #[arg(short, long)]
    feeds: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,

    /// Reload every feed once, wait for the results to be saved, and exit.
    #[arg(long)]
    once: bool,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_line(news: &StoredNews) {
    let date = news
        .item
        .published
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "no date".into());
    let marker = match news.state {
        NewsState::Updated => "*",
        _ => " ",
    };
    println!("{date:<18}{marker}{}  [{}]", news.item.title, news.item.source_name);
}

/// Prints the latest items of feeds marked "open on startup".
struct ConsoleOpener {
    store: Arc<MemoryStore>,
}

impl FeedViewOpener for ConsoleOpener {
    fn open(&self, subscriptions: &[Subscription]) {
        for sub in subscriptions {
            println!("== {} ==", sub.name);
            self.store.news(sub.id).iter().take(10).for_each(print_line);
        }
    }
}

/// Reload progress goes to the log; there is no status bar.
struct LogProgress;

impl ProgressSink for LogProgress {
    fn update(&self, label: &str, percent: u32) {
        debug!(percent, "{label}");
    }

    fn done(&self) {
        debug!("reload batch finished");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "livescroll_engine=debug,livescroll=debug"
    } else {
        "livescroll_engine=info,livescroll=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn load_subscriptions(cli: &Cli) -> Result<Vec<Subscription>> {
    if let Some(path) = &cli.feeds {
        let subs = FeedsFile::from_file(path)?.into_subscriptions();
        anyhow::ensure!(!subs.is_empty(), "{} lists no feeds", path.display());
        return Ok(subs);
    }
    let url = cli.url.clone().unwrap_or_else(|| DEFAULT_FEED.into());
    let mut sub = Subscription::new(SubscriptionId(1), "RSS", url);
    sub.prefs = SubscriptionPrefs {
        auto_update: true,
        interval_secs: DEFAULT_INTERVAL_SECS,
        reload_on_startup: true,
        open_on_startup: false,
    };
    Ok(vec![sub])
}

fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::from_env();
    let subscriptions = load_subscriptions(&cli)?;

    // -- storage -------------------------------------------------------------
    let events = EventHub::new();
    let store = Arc::new(MemoryStore::new(Arc::clone(&events)));
    for sub in subscriptions {
        store.insert_subscription(sub);
    }
    store.add_saved_search(SavedSearch {
        id: SavedSearchId(1),
        name: "New items".into(),
        conditions: vec![SearchCondition::StateIs(NewsState::New)],
        match_all: true,
    });

    events.saved_searches.subscribe(|event| {
        info!(search = event.search.0, new = event.counts.new, "saved search changed");
    });

    // -- engine --------------------------------------------------------------
    let source = Arc::new(RssSource::new()?);
    let credentials: Arc<TerminalCredentials> = if cli.once {
        Arc::new(TerminalCredentials::non_interactive())
    } else {
        Arc::new(TerminalCredentials::new())
    };
    let ctx = AppContext::new(
        settings,
        Collaborators {
            events: Arc::clone(&events),
            source: source.clone(),
            icons: source,
            tokens: store.clone(),
            credentials,
            subscriptions: store.clone(),
            persistence: store.clone(),
            index: store.clone(),
            searches: store.clone(),
            opener: Arc::new(ConsoleOpener {
                store: Arc::clone(&store),
            }),
            progress: Some(Arc::new(LogProgress)),
        },
    )?;

    // -- live output ---------------------------------------------------------
    // Merges arrive in bursts; print once per burst.
    let printer = Arc::clone(&store);
    let printed = Mutex::new(HashSet::new());
    let output = Arc::new(BatchedBuffer::new(
        "output",
        OUTPUT_BATCH,
        ctx.timers().clone(),
        move |ids: Vec<SubscriptionId>, _: &Monitor| {
            let mut printed = printed.lock().unwrap_or_else(PoisonError::into_inner);
            for id in ids {
                for news in printer.news(id) {
                    let fresh = matches!(news.state, NewsState::New | NewsState::Updated);
                    if fresh && printed.insert((id, news.item.id.clone(), news.item.title.clone())) {
                        print_line(&news);
                    }
                }
            }
        },
    ));
    let sink = Arc::clone(&output);
    events.news.subscribe(move |event| sink.add([event.subscription]));

    if cli.once {
        let ids: Vec<SubscriptionId> = store.all().iter().map(|s| s.id).collect();
        ctx.reloader().reload(&ids);
        let timeout = ctx.settings().connection_timeout * 2 + Duration::from_secs(5);
        if !ctx.wait_idle(timeout) {
            info!("gave up waiting for reloads");
        }
        // Let the last burst reach the terminal.
        std::thread::sleep(OUTPUT_BATCH * 2);
        output.seal(true);
        ctx.shutdown();
        return Ok(());
    }

    let (quit_tx, quit_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    })
    .context("set Ctrl+C handler")?;

    ctx.startup();
    let _ = quit_rx.recv();
    info!("shutting down");
    output.seal(false);
    ctx.shutdown();
    Ok(())
}
