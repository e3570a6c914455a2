//! Authorization header handling for protected URL groups.
//!
//! Basic credentials go to the [`CredentialProvider`] after the per-peer
//! throttle. Every other scheme is one leg of a [`SecurityProvider`]
//! exchange. A completed exchange may be cached on the connection.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::context::Services;
use crate::security::credentials::split_account;
use crate::security::{AccessToken, SecurityStep};
use crate::observability::metrics;
use crate::session::policy::{AuthSchemes, AuthSettings};

/// Outcome reported to the application with each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStatus {
    /// No Authorization header, or the group does not authenticate.
    #[default]
    NotAuthenticated,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthInfo {
    pub status: AuthStatus,
    pub scheme: AuthSchemes,
    pub token: Option<AccessToken>,
}

impl AuthInfo {
    fn failure(scheme: AuthSchemes) -> Self {
        Self {
            status: AuthStatus::Failure,
            scheme,
            token: None,
        }
    }

    fn success(scheme: AuthSchemes, token: AccessToken) -> Self {
        Self {
            status: AuthStatus::Success,
            scheme,
            token: Some(token),
        }
    }
}

/// What the connection does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Queue the request with this information.
    Proceed(AuthInfo),
    /// Answer 401 with this `WWW-Authenticate` value and wait for the next leg.
    Challenge(String),
}

/// Token kept on a connection between requests.
#[derive(Debug, Default)]
pub struct CredentialCache {
    cached: Option<(AuthSchemes, AccessToken, Instant)>,
}

impl CredentialCache {
    fn get(&mut self, idle_timeout: Duration) -> Option<(AuthSchemes, AccessToken)> {
        let (scheme, token, last_used) = self.cached.as_mut()?;
        if last_used.elapsed() > idle_timeout {
            self.cached = None;
            return None;
        }
        *last_used = Instant::now();
        Some((*scheme, token.clone()))
    }

    fn store(&mut self, scheme: AuthSchemes, token: AccessToken) {
        self.cached = Some((scheme, token, Instant::now()));
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }
}

pub fn scheme_name(scheme: AuthSchemes) -> &'static str {
    match scheme {
        AuthSchemes::BASIC => "Basic",
        AuthSchemes::DIGEST => "Digest",
        AuthSchemes::NTLM => "NTLM",
        AuthSchemes::NEGOTIATE => "Negotiate",
        AuthSchemes::KERBEROS => "Kerberos",
        _ => "",
    }
}

const SCHEMES: [AuthSchemes; 5] = [
    AuthSchemes::BASIC,
    AuthSchemes::DIGEST,
    AuthSchemes::NTLM,
    AuthSchemes::NEGOTIATE,
    AuthSchemes::KERBEROS,
];

/// Split an Authorization value into its scheme and payload.
pub fn parse_authorization(value: &str) -> Option<(AuthSchemes, &str)> {
    let value = value.trim();
    let (name, payload) = value.split_once(' ').unwrap_or((value, ""));
    let scheme = SCHEMES
        .into_iter()
        .find(|s| scheme_name(*s).eq_ignore_ascii_case(name))?;
    Some((scheme, payload.trim()))
}

/// Decode a Basic payload into user and password.
pub fn decode_basic(payload: &str) -> Option<(String, String)> {
    let raw = STANDARD.decode(payload).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// `WWW-Authenticate` values for every scheme the group enables.
pub fn challenges(settings: &AuthSettings, services: &Services) -> Vec<String> {
    SCHEMES
        .into_iter()
        .filter(|s| settings.schemes.contains(*s))
        .map(|scheme| match scheme {
            AuthSchemes::BASIC => format!("Basic realm=\"{}\"", settings.realm),
            other => match services.security.initial_challenge(other) {
                Some(param) => format!("{} {}", scheme_name(other), param),
                None => scheme_name(other).to_string(),
            },
        })
        .collect()
}

/// Authentication for one connection.
pub struct Authenticator<'a> {
    pub services: &'a Services,
    pub settings: &'a AuthSettings,
    pub peer: IpAddr,
    pub connection: u64,
    pub idle_timeout: Duration,
}

impl Authenticator<'_> {
    pub fn authenticate(&self, authorization: Option<&str>, cache: &mut CredentialCache) -> AuthOutcome {
        if !self.settings.is_enabled() {
            return AuthOutcome::Proceed(AuthInfo::default());
        }
        if self.settings.credential_caching {
            if let Some((scheme, token)) = cache.get(self.idle_timeout) {
                tracing::trace!(connection_id = self.connection, user = %token.user, "Cached credentials reused");
                return AuthOutcome::Proceed(AuthInfo::success(scheme, token));
            }
        }
        let Some(value) = authorization else {
            return AuthOutcome::Proceed(AuthInfo::default());
        };
        let Some((scheme, payload)) = parse_authorization(value) else {
            tracing::debug!(connection_id = self.connection, "Unrecognised authorization scheme");
            return AuthOutcome::Proceed(AuthInfo::failure(AuthSchemes::NONE));
        };
        if !self.settings.schemes.contains(scheme) {
            return AuthOutcome::Proceed(AuthInfo::failure(scheme));
        }

        let outcome = if scheme == AuthSchemes::BASIC {
            self.basic(payload)
        } else {
            self.exchange(scheme, payload)
        };
        if let AuthOutcome::Proceed(AuthInfo {
            status: AuthStatus::Success,
            token: Some(token),
            ..
        }) = &outcome
        {
            if self.settings.credential_caching {
                cache.store(scheme, token.clone());
            }
        }
        outcome
    }

    fn basic(&self, payload: &str) -> AuthOutcome {
        let throttle = &self.services.logon_throttle;
        if !throttle.allows(self.peer) {
            metrics::record_logon_failure("throttled");
            tracing::warn!(peer_addr = %self.peer, "Basic logon throttled");
            return AuthOutcome::Proceed(AuthInfo::failure(AuthSchemes::BASIC));
        }
        let Some((account, password)) = decode_basic(payload) else {
            throttle.record_failure(self.peer);
            return AuthOutcome::Proceed(AuthInfo::failure(AuthSchemes::BASIC));
        };
        let (domain, user) = split_account(&account);
        let domain = domain.or((!self.settings.domain.is_empty()).then_some(self.settings.domain.as_str()));

        match self.services.credentials.logon(user, domain, &password) {
            Some(token) => {
                throttle.record_success(self.peer);
                tracing::debug!(connection_id = self.connection, user = %token.user, "Basic logon succeeded");
                AuthOutcome::Proceed(AuthInfo::success(AuthSchemes::BASIC, token))
            }
            None => {
                throttle.record_failure(self.peer);
                metrics::record_logon_failure("basic");
                tracing::info!(peer_addr = %self.peer, user, "Basic logon failed");
                AuthOutcome::Proceed(AuthInfo::failure(AuthSchemes::BASIC))
            }
        }
    }

    fn exchange(&self, scheme: AuthSchemes, payload: &str) -> AuthOutcome {
        let Ok(input) = STANDARD.decode(payload) else {
            return AuthOutcome::Proceed(AuthInfo::failure(scheme));
        };
        match self.services.security.step(scheme, self.connection, &input) {
            SecurityStep::Continue(output) => {
                AuthOutcome::Challenge(format!("{} {}", scheme_name(scheme), STANDARD.encode(output)))
            }
            SecurityStep::Complete(token) => AuthOutcome::Proceed(AuthInfo::success(scheme, token)),
            SecurityStep::Denied => {
                metrics::record_logon_failure(scheme_name(scheme));
                AuthOutcome::Proceed(AuthInfo::failure(scheme))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::config::Registry;
    use crate::config::RegistryStore;
    use crate::security::{LocalAccounts, LogonThrottle, SecurityProvider};

    fn services() -> Services {
        Services::new(Arc::new(RegistryStore::new(Registry::default())))
            .with_credentials(Arc::new(LocalAccounts::new().with_account(None, "alice", "secret")))
            .with_logon_throttle(LogonThrottle::new(2))
    }

    fn basic_settings() -> AuthSettings {
        AuthSettings {
            schemes: AuthSchemes::BASIC,
            realm: "test".into(),
            ..AuthSettings::default()
        }
    }

    fn authenticator<'a>(services: &'a Services, settings: &'a AuthSettings) -> Authenticator<'a> {
        Authenticator {
            services,
            settings,
            peer: IpAddr::from([10, 0, 0, 1]),
            connection: 1,
            idle_timeout: Duration::from_secs(120),
        }
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    #[test]
    fn parses_scheme_names_case_insensitively() {
        assert_eq!(parse_authorization("basic abc"), Some((AuthSchemes::BASIC, "abc")));
        assert_eq!(parse_authorization("Negotiate  YII="), Some((AuthSchemes::NEGOTIATE, "YII=")));
        assert_eq!(parse_authorization("Bearer x"), None);
        assert_eq!(decode_basic("YWxpY2U6c2VjcmV0"), Some(("alice".into(), "secret".into())));
        assert_eq!(decode_basic("!!"), None);
    }

    #[test]
    fn valid_basic_credentials_succeed() {
        let services = services();
        let settings = basic_settings();
        let mut cache = CredentialCache::default();
        let outcome = authenticator(&services, &settings).authenticate(Some(&basic("alice", "secret")), &mut cache);
        let AuthOutcome::Proceed(info) = outcome else {
            panic!("expected proceed");
        };
        assert_eq!(info.status, AuthStatus::Success);
        assert_eq!(info.token.unwrap().user, "alice");
    }

    #[test]
    fn missing_header_is_not_authenticated() {
        let services = services();
        let settings = basic_settings();
        let outcome = authenticator(&services, &settings).authenticate(None, &mut CredentialCache::default());
        assert_eq!(outcome, AuthOutcome::Proceed(AuthInfo::default()));
    }

    #[test]
    fn throttle_blocks_after_repeated_failures() {
        let services = services();
        let settings = basic_settings();
        let auth = authenticator(&services, &settings);
        let mut cache = CredentialCache::default();
        for _ in 0..2 {
            auth.authenticate(Some(&basic("alice", "wrong")), &mut cache);
        }
        let outcome = auth.authenticate(Some(&basic("alice", "secret")), &mut cache);
        assert_eq!(outcome, AuthOutcome::Proceed(AuthInfo::failure(AuthSchemes::BASIC)));
    }

    #[test]
    fn cached_token_skips_the_header() {
        let services = services();
        let settings = basic_settings();
        let auth = authenticator(&services, &settings);
        let mut cache = CredentialCache::default();
        auth.authenticate(Some(&basic("alice", "secret")), &mut cache);
        let AuthOutcome::Proceed(info) = auth.authenticate(None, &mut cache) else {
            panic!("expected proceed");
        };
        assert_eq!(info.status, AuthStatus::Success);
    }

    struct TwoLeg(AtomicU32);

    impl SecurityProvider for TwoLeg {
        fn step(&self, _scheme: AuthSchemes, _connection: u64, input: &[u8]) -> SecurityStep {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                SecurityStep::Continue(b"challenge".to_vec())
            } else {
                SecurityStep::Complete(AccessToken {
                    user: String::from_utf8_lossy(input).into_owned(),
                    domain: None,
                    context: Vec::new(),
                })
            }
        }
    }

    #[test]
    fn provider_exchange_continues_then_completes() {
        let services = services().with_security_provider(Arc::new(TwoLeg(AtomicU32::new(0))));
        let settings = AuthSettings {
            schemes: AuthSchemes::NTLM,
            ..AuthSettings::default()
        };
        let auth = authenticator(&services, &settings);
        let mut cache = CredentialCache::default();
        let header = format!("NTLM {}", STANDARD.encode("bob"));

        let first = auth.authenticate(Some(&header), &mut cache);
        assert_eq!(first, AuthOutcome::Challenge(format!("NTLM {}", STANDARD.encode("challenge"))));
        let AuthOutcome::Proceed(info) = auth.authenticate(Some(&header), &mut cache) else {
            panic!("expected proceed");
        };
        assert_eq!(info.token.unwrap().user, "bob");
    }

    #[test]
    fn challenges_cover_enabled_schemes() {
        let services = services();
        let settings = AuthSettings {
            schemes: AuthSchemes::BASIC | AuthSchemes::NEGOTIATE,
            realm: "r".into(),
            ..AuthSettings::default()
        };
        assert_eq!(challenges(&settings, &services), vec!["Basic realm=\"r\"", "Negotiate"]);
    }
}
