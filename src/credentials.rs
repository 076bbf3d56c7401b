//! Terminal login prompt: username on stdin, password via `rpassword`.
//!
//! Accepted logins are kept in memory for the life of the process, keyed by
//! normalized address and realm.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::model::{normalize_address, Credentials};
use crate::ports::CredentialsProvider;

type LoginKey = (String, Option<String>);

pub struct TerminalCredentials {
    logins: Mutex<HashMap<LoginKey, Credentials>>,
    interactive: bool,
}

impl TerminalCredentials {
    pub fn new() -> Self {
        Self {
            logins: Mutex::new(HashMap::new()),
            interactive: true,
        }
    }

    /// Never prompts; only preloaded logins are served.
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            ..Self::new()
        }
    }

    /// Remember a login for `address` (normalized here) and `realm`.
    pub fn remember(&self, address: &str, realm: Option<&str>, credentials: Credentials) {
        self.logins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(&normalize_address(address), realm), credentials);
    }

    fn ask(&self, address: &str, realm: Option<&str>) -> Result<Option<Credentials>> {
        let mut stderr = io::stderr();
        match realm {
            Some(realm) => writeln!(stderr, "Login required for {address} ({realm})")?,
            None => writeln!(stderr, "Login required for {address}")?,
        }
        write!(stderr, "Username (empty to cancel): ")?;
        stderr.flush()?;

        let mut username = String::new();
        io::stdin()
            .lock()
            .read_line(&mut username)
            .context("read username")?;
        let username = username.trim().to_string();
        if username.is_empty() {
            return Ok(None);
        }
        let password = rpassword::prompt_password("Password: ").context("read password")?;
        Ok(Some(Credentials { username, password }))
    }
}

impl Default for TerminalCredentials {
    fn default() -> Self {
        Self::new()
    }
}

fn key(normalized: &str, realm: Option<&str>) -> LoginKey {
    (normalized.to_string(), realm.map(String::from))
}

impl CredentialsProvider for TerminalCredentials {
    fn credentials(&self, normalized_address: &str, realm: Option<&str>) -> Option<Credentials> {
        self.logins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(normalized_address, realm))
            .cloned()
    }

    fn prompt_login(&self, address: &str, realm: Option<&str>) -> Option<Credentials> {
        if !self.interactive {
            info!(address, "login required but prompting is disabled");
            return None;
        }
        match self.ask(address, realm) {
            Ok(Some(credentials)) => {
                self.remember(address, realm, credentials.clone());
                Some(credentials)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(address, error = %e, "login prompt failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann() -> Credentials {
        Credentials {
            username: "ann".into(),
            password: "pw".into(),
        }
    }

    #[test]
    fn logins_are_keyed_by_origin_and_realm() {
        let creds = TerminalCredentials::non_interactive();
        creds.remember("https://example.com/private/feed.xml", Some("members"), ann());

        assert_eq!(creds.credentials("https://example.com", Some("members")), Some(ann()));
        assert_eq!(creds.credentials("https://example.com", None), None);
        assert_eq!(creds.credentials("https://other.example", Some("members")), None);
    }

    #[test]
    fn non_interactive_prompt_is_declined() {
        let creds = TerminalCredentials::non_interactive();
        assert_eq!(creds.prompt_login("https://example.com/feed", None), None);
    }
}
