//! Credential checking for Basic authentication.

use std::collections::HashMap;

use crate::config::schema::AccountConfig;

/// Identity established by a successful logon or security exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub user: String,
    pub domain: Option<String>,
    /// Opaque provider material, empty for Basic logons.
    pub context: Vec<u8>,
}

/// Checks a user name and password.
pub trait CredentialProvider: Send + Sync {
    fn logon(&self, user: &str, domain: Option<&str>, password: &str) -> Option<AccessToken>;
}

/// Split `domain\user` into its parts. A bare user has no domain.
pub fn split_account(account: &str) -> (Option<&str>, &str) {
    match account.split_once('\\') {
        Some((domain, user)) if !domain.is_empty() => (Some(domain), user),
        Some((_, user)) => (None, user),
        None => (None, account),
    }
}

/// In-memory account list. User and domain compare case-insensitively.
#[derive(Debug, Default, Clone)]
pub struct LocalAccounts {
    accounts: HashMap<(String, String), String>,
}

impl LocalAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        let mut local = Self::new();
        for account in accounts {
            local.add(account.domain.as_deref(), &account.user, &account.password);
        }
        local
    }

    pub fn with_account(mut self, domain: Option<&str>, user: &str, password: &str) -> Self {
        self.add(domain, user, password);
        self
    }

    pub fn add(&mut self, domain: Option<&str>, user: &str, password: &str) {
        self.accounts.insert(key(domain, user), password.to_string());
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

fn key(domain: Option<&str>, user: &str) -> (String, String) {
    (
        domain.unwrap_or_default().to_ascii_lowercase(),
        user.to_ascii_lowercase(),
    )
}

impl CredentialProvider for LocalAccounts {
    fn logon(&self, user: &str, domain: Option<&str>, password: &str) -> Option<AccessToken> {
        let stored = self
            .accounts
            .get(&key(domain, user))
            .or_else(|| domain.and_then(|_| self.accounts.get(&key(None, user))))?;
        if !constant_time_eq(stored.as_bytes(), password.as_bytes()) {
            return None;
        }
        Some(AccessToken {
            user: user.to_string(),
            domain: domain.map(str::to_string),
            context: Vec::new(),
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_account_forms() {
        assert_eq!(split_account("alice"), (None, "alice"));
        assert_eq!(split_account("CORP\\alice"), (Some("CORP"), "alice"));
        assert_eq!(split_account("\\alice"), (None, "alice"));
    }

    #[test]
    fn logon_checks_password_and_folds_case() {
        let accounts = LocalAccounts::new().with_account(None, "Alice", "secret");
        let token = accounts.logon("alice", None, "secret").unwrap();
        assert_eq!(token.user, "alice");
        assert!(accounts.logon("alice", None, "Secret").is_none());
        assert!(accounts.logon("bob", None, "secret").is_none());
    }

    #[test]
    fn domain_accounts_and_fallback_to_local() {
        let accounts = LocalAccounts::new()
            .with_account(Some("CORP"), "carol", "pw1")
            .with_account(None, "dave", "pw2");
        assert!(accounts.logon("carol", Some("corp"), "pw1").is_some());
        assert!(accounts.logon("carol", None, "pw1").is_none());
        assert!(accounts.logon("dave", Some("OTHER"), "pw2").is_some());
    }
}
