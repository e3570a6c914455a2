//! Security provider for the challenge/response schemes.
//!
//! NTLM, Negotiate, Kerberos and Digest are multi-leg exchanges. The
//! request layer hands each client token to the provider together with the
//! connection id, and the provider answers with one step.

use crate::security::credentials::AccessToken;
use crate::session::policy::AuthSchemes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityStep {
    /// Send this challenge back with a 401 and wait for the next leg.
    Continue(Vec<u8>),
    Complete(AccessToken),
    Denied,
}

pub trait SecurityProvider: Send + Sync {
    /// Run one exchange step for `scheme` on `connection`.
    fn step(&self, scheme: AuthSchemes, connection: u64, input: &[u8]) -> SecurityStep;

    /// Initial `WWW-Authenticate` parameter for a scheme, if it has one.
    fn initial_challenge(&self, _scheme: AuthSchemes) -> Option<String> {
        None
    }

    /// The connection went away; drop any partial exchange.
    fn release(&self, _connection: u64) {}
}

/// Provider used when none is configured: every exchange is denied.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl SecurityProvider for DenyAll {
    fn step(&self, scheme: AuthSchemes, connection: u64, _input: &[u8]) -> SecurityStep {
        tracing::debug!(?scheme, connection, "No security provider configured, denying");
        SecurityStep::Denied
    }
}
