//! The save step, run on the single-slot save queue.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ReloaderInner, TokenUpdate};
use crate::error::ReloadError;
use crate::model::{ParsedFeed, Subscription};
use crate::task::{Monitor, Task, TaskStatus};

/// Everything a reload hands over for persisting.
pub(super) struct SaveJob {
    pub subscription: Subscription,
    /// `None` for an icon-only save.
    pub feed: Option<ParsedFeed>,
    pub tokens: TokenUpdate,
    pub icon: Option<Vec<u8>>,
}

pub(super) struct SaveTask {
    /// Unique per save; saves are never coalesced.
    key: String,
    job: SaveJob,
    reloader: Arc<ReloaderInner>,
}

impl SaveTask {
    pub fn new(seq: u64, job: SaveJob, reloader: Arc<ReloaderInner>) -> Self {
        Self {
            key: format!("save:{}:{seq}", job.subscription.id.0),
            job,
            reloader,
        }
    }
}

impl Task for SaveTask {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> String {
        format!("Saving {}", self.job.subscription.name)
    }

    fn run(&self, monitor: &Monitor) -> TaskStatus {
        if monitor.is_cancelled() {
            return TaskStatus::Cancelled;
        }
        let services = &self.reloader.services;
        let sub = &self.job.subscription;
        if services.subscriptions.get(sub.id).is_none() {
            debug!(subscription = %sub.id, "deleted before save");
            return TaskStatus::Ok;
        }

        if let Some(feed) = &self.job.feed {
            let (tokens, delete_tokens) = self.job.tokens.as_save_args();
            match services.persistence.merge_and_save(sub, feed, tokens, delete_tokens) {
                Ok(summary) => info!(
                    subscription = %sub.id,
                    added = summary.added,
                    updated = summary.updated,
                    "feed saved"
                ),
                Err(e) => return TaskStatus::Error(ReloadError::InternalTaskFailure(format!("{e:#}"))),
            }
        }
        if let Some(icon) = &self.job.icon {
            if let Err(e) = services.persistence.save_icon(sub.id, icon.clone()) {
                warn!(subscription = %sub.id, error = %e, "icon not saved");
            }
        }
        TaskStatus::Ok
    }
}
