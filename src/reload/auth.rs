//! Login handling for feeds that answer "authentication required".
//!
//! Prompts are serialized through one lock shared by every reload.  After
//! acquiring it, a run first looks for credentials that appeared while it
//! waited (another run's prompt for the same origin and realm) and simply
//! retries with those, so a burst of protected feeds asks the user once.

use std::sync::{Arc, PoisonError};

use tracing::{debug, info, warn};

use super::{ReloadOutcome, ReloadSession, ReloaderInner};
use crate::error::ReloadError;
use crate::model::SubscriptionId;
use crate::ports::SubscriptionStore;
use crate::task::{Monitor, Priority};

impl ReloaderInner {
    pub(super) fn authenticate(
        self: &Arc<Self>,
        session: &ReloadSession,
        realm: Option<String>,
        monitor: &Monitor,
    ) -> ReloadOutcome {
        let _login = self.login.lock().unwrap_or_else(PoisonError::into_inner);
        if self.should_stop(monitor) {
            return ReloadOutcome::Cancelled;
        }

        let sub = &session.subscription;
        let credentials = &self.services.credentials;
        let current = credentials.credentials(&session.normalized, realm.as_deref());
        if session.is_new_login(current.as_ref()) {
            debug!(subscription = %sub.id, "login supplied meanwhile, retrying");
            self.remember_realm(sub.id, realm.as_deref());
            return self.retry(sub.id);
        }

        info!(subscription = %sub.id, realm = realm.as_deref().unwrap_or(""), "login required");
        match credentials.prompt_login(&sub.address, realm.as_deref()) {
            Some(_) => {
                self.remember_realm(sub.id, realm.as_deref());
                self.retry(sub.id)
            }
            None => {
                let message = ReloadError::AuthenticationRequired { realm }.to_string();
                self.set_error(sub.id, true, Some(message));
                ReloadOutcome::LoginDeclined
            }
        }
    }

    fn remember_realm(&self, id: SubscriptionId, realm: Option<&str>) {
        let subscriptions: &dyn SubscriptionStore = self.services.subscriptions.as_ref();
        let Some(mut sub) = subscriptions.get(id) else {
            return;
        };
        if realm.is_none() || sub.realm.as_deref() == realm {
            return;
        }
        sub.realm = realm.map(String::from);
        if let Err(e) = subscriptions.update(&sub) {
            warn!(subscription = %id, error = %e, "could not remember realm");
        }
    }

    fn retry(self: &Arc<Self>, id: SubscriptionId) -> ReloadOutcome {
        match self.services.subscriptions.get(id) {
            Some(sub) => {
                self.reload_queue.submit([self.task(&sub, Priority::Short)]);
                ReloadOutcome::LoginRetry
            }
            None => ReloadOutcome::Missing,
        }
    }
}
