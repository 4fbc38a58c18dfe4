//! Password authentication: what to decide, and what to record.
//!
//! The decision ([AuthPolicy]) and the observation ([AuthObserver]) are
//! separate so that a deployment can put a real gate in front of the
//! same credential log.

use std::net::SocketAddr;

use tracing::info;

/// One password attempt, as seen during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub client: SocketAddr,
    pub user: String,
    pub password: String,
    /// The client's identification string, e.g. `SSH-2.0-OpenSSH_9.6`.
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Let the client in, with no restrictions.
    Accept,
    Reject,
}

pub trait AuthPolicy: Send + Sync {
    fn decide(&self, attempt: &AuthAttempt) -> AuthDecision;
}

/// Accepts every password without looking at it.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AuthPolicy for AcceptAll {
    fn decide(&self, _: &AuthAttempt) -> AuthDecision {
        AuthDecision::Accept
    }
}

/// Called once for every attempt, after the policy has decided.
pub trait AuthObserver: Send + Sync {
    fn observe(&self, attempt: &AuthAttempt, decision: AuthDecision);
}

/// Writes each attempt, credentials included, to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl AuthObserver for LogObserver {
    fn observe(&self, attempt: &AuthAttempt, decision: AuthDecision) {
        match decision {
            AuthDecision::Accept => info!(
                client = %attempt.client,
                user = %attempt.user,
                password = %attempt.password,
                version = %attempt.version,
                "Password authentication accepted"
            ),
            AuthDecision::Reject => info!(
                client = %attempt.client,
                user = %attempt.user,
                password = %attempt.password,
                version = %attempt.version,
                "Password authentication rejected"
            ),
        }
    }
}
