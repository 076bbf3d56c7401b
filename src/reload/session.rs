//! Per-run state of one reload.

use crate::model::{normalize_address, ConditionalTokens, Credentials, Subscription};

/// What to do with the stored conditional tokens after a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenUpdate {
    /// Nothing to write.
    Keep,
    /// Create the record, or update the existing one in place.
    Store(ConditionalTokens),
    /// The server stopped sending validators; drop the record.
    Delete,
}

impl TokenUpdate {
    pub fn decide(previous: Option<&ConditionalTokens>, fresh: Option<ConditionalTokens>) -> Self {
        match (previous, fresh) {
            (Some(old), Some(new)) if *old == new => Self::Keep,
            (_, Some(new)) => Self::Store(new),
            (Some(_), None) => Self::Delete,
            (None, None) => Self::Keep,
        }
    }

    /// Arguments for [`FeedPersistence::merge_and_save`](crate::ports::FeedPersistence::merge_and_save).
    pub fn as_save_args(&self) -> (Option<&ConditionalTokens>, bool) {
        match self {
            Self::Keep => (None, false),
            Self::Store(tokens) => (Some(tokens), false),
            Self::Delete => (None, true),
        }
    }
}

/// Inputs gathered before the fetch of one reload run.
#[derive(Debug, Clone)]
pub struct ReloadSession {
    pub subscription: Subscription,
    /// Origin of the feed address; the credentials key.
    pub normalized: String,
    pub tokens: Option<ConditionalTokens>,
    /// Credentials the fetch was attempted with.
    pub credentials: Option<Credentials>,
}

impl ReloadSession {
    pub fn new(
        subscription: Subscription,
        tokens: Option<ConditionalTokens>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            normalized: normalize_address(&subscription.address),
            subscription,
            tokens,
            credentials,
        }
    }

    /// `true` when `current` are credentials this run has not tried yet.
    pub fn is_new_login(&self, current: Option<&Credentials>) -> bool {
        current.is_some() && current != self.credentials.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubscriptionId;

    fn etag(v: &str) -> ConditionalTokens {
        ConditionalTokens {
            last_modified: None,
            etag: Some(v.into()),
        }
    }

    #[test]
    fn token_plan_covers_every_transition() {
        assert_eq!(TokenUpdate::decide(None, Some(etag("a"))), TokenUpdate::Store(etag("a")));
        assert_eq!(
            TokenUpdate::decide(Some(&etag("a")), Some(etag("b"))),
            TokenUpdate::Store(etag("b"))
        );
        assert_eq!(TokenUpdate::decide(Some(&etag("a")), Some(etag("a"))), TokenUpdate::Keep);
        assert_eq!(TokenUpdate::decide(Some(&etag("a")), None), TokenUpdate::Delete);
        assert_eq!(TokenUpdate::decide(None, None), TokenUpdate::Keep);
    }

    #[test]
    fn save_args_follow_the_plan() {
        let store = TokenUpdate::Store(etag("x"));
        assert_eq!(store.as_save_args(), (Some(&etag("x")), false));
        assert_eq!(TokenUpdate::Delete.as_save_args(), (None, true));
        assert_eq!(TokenUpdate::Keep.as_save_args(), (None, false));
    }

    #[test]
    fn only_untried_credentials_count_as_new() {
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let sub = Subscription::new(SubscriptionId(1), "s", "https://a.example/feed");
        let anonymous = ReloadSession::new(sub.clone(), None, None);
        assert_eq!(anonymous.normalized, "https://a.example");
        assert!(anonymous.is_new_login(Some(&creds)));
        assert!(!anonymous.is_new_login(None));

        let tried = ReloadSession::new(sub, None, Some(creds.clone()));
        assert!(!tried.is_new_login(Some(&creds)));
    }
}
