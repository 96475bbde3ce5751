//! Public key authentication and username routing.
//!
//! This module handles:
//! - Computing SSH key fingerprints in the "SHA256:..." form
//! - Parsing the "<user>.<ns-suffix>-<devbox>" username encoding
//! - Classifying connections into an authentication mode

use anyhow::{anyhow, Result};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::registry::{DevboxInfo, Registry};

/// How the gateway will authenticate to the backend for this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// The client's key matched a devbox credential; dial with the stored signer.
    PublicKey,
    /// Unknown key, routed by username; dial with the client's forwarded agent.
    AgentForwarding,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::PublicKey => write!(f, "public-key"),
            AuthMode::AgentForwarding => write!(f, "agent-forwarding"),
        }
    }
}

/// Why an authentication attempt was refused. Internal only; every variant
/// surfaces on the wire as a plain auth failure.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthReject {
    UnknownKey,
    MalformedUserName(String),
    NoSuchDevbox,
    DevboxNotRunning,
    /// Devbox credential has no usable private key, so a public-key mode
    /// dial could never succeed.
    DevboxNotRouteable,
}

impl fmt::Display for AuthReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthReject::UnknownKey => write!(f, "unknown public key"),
            AuthReject::MalformedUserName(e) => write!(f, "invalid username format: {e}"),
            AuthReject::NoSuchDevbox => write!(f, "no such devbox"),
            AuthReject::DevboxNotRunning => write!(f, "devbox not running"),
            AuthReject::DevboxNotRouteable => write!(f, "devbox has no private key"),
        }
    }
}

/// Routing state attached to a connection at auth time. Immutable afterwards.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub info: Arc<DevboxInfo>,
    pub real_user: String,
    pub mode: AuthMode,
}

/// Routing target parsed from an SSH username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTarget {
    pub user: String,
    pub namespace: String,
    pub devbox: String,
}

/// Compute the SHA256 fingerprint of an SSH public key.
///
/// The fingerprint is SHA-256 over the raw key blob in SSH wire format,
/// rendered as "SHA256:<base64>" the way `ssh-keygen -l` prints it.
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{b64}")
}

/// Parse the "<user>.<ns-suffix>-<devbox>" username encoding.
///
/// The left half of the first '.' is the real user name; the right half
/// splits on the last '-' into the namespace suffix and the devbox name.
/// The suffix becomes a full namespace by prepending `namespace_prefix`.
pub fn parse_username(raw: &str, namespace_prefix: &str) -> Result<ParsedTarget> {
    let (user, target) = raw
        .split_once('.')
        .ok_or_else(|| anyhow!("missing '.' separator in username {raw:?}"))?;

    let (suffix, devbox) = target
        .rsplit_once('-')
        .ok_or_else(|| anyhow!("missing '-' separator in username {raw:?}"))?;

    if user.is_empty() || suffix.is_empty() || devbox.is_empty() {
        return Err(anyhow!("empty component in username {raw:?}"));
    }

    Ok(ParsedTarget {
        user: user.to_string(),
        namespace: format!("{namespace_prefix}{suffix}"),
        devbox: devbox.to_string(),
    })
}

/// The public-key callback decision: classify the connection into an auth
/// mode and produce the routing state, or a typed rejection. Never mutates
/// the registry.
pub fn resolve(
    registry: &Registry,
    config: &GatewayConfig,
    presented_user: &str,
    key: &PublicKey,
) -> Result<ResolvedRoute, AuthReject> {
    let fp = fingerprint(key);

    if let Some(info) = registry.lookup_by_fingerprint(&fp) {
        if info.pod_ip.is_empty() {
            return Err(AuthReject::DevboxNotRunning);
        }
        if info.private_key.is_none() {
            return Err(AuthReject::DevboxNotRouteable);
        }

        return Ok(ResolvedRoute {
            info,
            real_user: presented_user.to_string(),
            mode: AuthMode::PublicKey,
        });
    }

    // Unknown key: the username may encode the routing target, with the
    // client's local agent supplying the backend credential.
    let target = parse_username(presented_user, &config.namespace_prefix)
        .map_err(|e| AuthReject::MalformedUserName(e.to_string()))?;

    let info = registry
        .lookup_by_name(&target.namespace, &target.devbox)
        .ok_or(AuthReject::NoSuchDevbox)?;

    if info.pod_ip.is_empty() {
        return Err(AuthReject::DevboxNotRunning);
    }

    Ok(ResolvedRoute {
        info,
        real_user: target.user,
        mode: AuthMode::AgentForwarding,
    })
}

/// Run the resolver and log the outcome; the caller maps the result onto the
/// wire-level accept/reject, which never carries the specific reject kind.
pub fn resolve_logged(
    registry: &Registry,
    config: &GatewayConfig,
    presented_user: &str,
    key: &PublicKey,
) -> Option<ResolvedRoute> {
    match resolve(registry, config, presented_user, key) {
        Ok(route) => {
            info!(
                user = presented_user,
                namespace = %route.info.namespace,
                devbox = %route.info.devbox_name,
                mode = %route.mode,
                "Accepted public key"
            );
            Some(route)
        }
        Err(reject) => {
            warn!(
                user = presented_user,
                fingerprint = %fingerprint(key),
                "Rejected public key: {reject}"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostkey;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            namespace_prefix: String::new(),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_parse_username() {
        let parsed = parse_username("alice.ns-db", "").unwrap();
        assert_eq!(
            parsed,
            ParsedTarget {
                user: "alice".to_string(),
                namespace: "ns".to_string(),
                devbox: "db".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_username_applies_prefix() {
        let parsed = parse_username("alice.abc123-dev", "ns-").unwrap();
        assert_eq!(parsed.namespace, "ns-abc123");
        assert_eq!(parsed.devbox, "dev");
    }

    #[test]
    fn test_parse_username_splits_on_first_dot_and_last_dash() {
        // Dots in the devbox half stay put; dashes bind to the rightmost.
        let parsed = parse_username("bob.smith.user-ns-my-box", "").unwrap();
        assert_eq!(parsed.user, "bob");
        assert_eq!(parsed.namespace, "smith.user-ns-my");
        assert_eq!(parsed.devbox, "box");
    }

    #[test]
    fn test_parse_username_missing_dot() {
        let err = parse_username("alice-db", "").unwrap_err();
        assert!(err.to_string().contains("'.'"));
    }

    #[test]
    fn test_parse_username_missing_dash() {
        let err = parse_username("alice.devbox", "").unwrap_err();
        assert!(err.to_string().contains("'-'"));
    }

    #[test]
    fn test_parse_username_empty_components() {
        assert!(parse_username(".ns-db", "").is_err());
        assert!(parse_username("alice.-db", "").is_err());
        assert!(parse_username("alice.ns-", "").is_err());
    }

    #[test]
    fn test_resolve_known_fingerprint() {
        let reg = Registry::new();
        let private = hostkey::derive("devbox-key");
        let public = private.public_key().clone();
        reg.upsert_credential("ns", "db", public.clone(), Some(private));
        reg.upsert_pod_ip("ns", "db", "10.0.0.5");

        let route = resolve(&reg, &test_config(), "whatever", &public).unwrap();
        assert_eq!(route.mode, AuthMode::PublicKey);
        assert_eq!(route.real_user, "whatever");
        assert_eq!(route.info.pod_ip, "10.0.0.5");
    }

    #[test]
    fn test_resolve_known_fingerprint_not_running() {
        let reg = Registry::new();
        let private = hostkey::derive("devbox-key");
        let public = private.public_key().clone();
        reg.upsert_credential("ns", "db", public.clone(), Some(private));

        let err = resolve(&reg, &test_config(), "user", &public).unwrap_err();
        assert_eq!(err, AuthReject::DevboxNotRunning);
    }

    #[test]
    fn test_resolve_known_fingerprint_without_signer() {
        let reg = Registry::new();
        let private = hostkey::derive("devbox-key");
        let public = private.public_key().clone();
        reg.upsert_credential("ns", "db", public.clone(), None);
        reg.upsert_pod_ip("ns", "db", "10.0.0.5");

        let err = resolve(&reg, &test_config(), "user", &public).unwrap_err();
        assert_eq!(err, AuthReject::DevboxNotRouteable);
    }

    #[test]
    fn test_resolve_agent_forwarding_by_username() {
        let reg = Registry::new();
        let private = hostkey::derive("devbox-key");
        reg.upsert_credential("ns", "db", private.public_key().clone(), Some(private));
        reg.upsert_pod_ip("ns", "db", "10.0.0.6");

        let stranger = hostkey::derive("some-other-key");
        let route = resolve(
            &reg,
            &test_config(),
            "alice.ns-db",
            stranger.public_key(),
        )
        .unwrap();
        assert_eq!(route.mode, AuthMode::AgentForwarding);
        assert_eq!(route.real_user, "alice");
        assert_eq!(route.info.pod_ip, "10.0.0.6");
    }

    #[test]
    fn test_resolve_unknown_key_bad_username() {
        let reg = Registry::new();
        let stranger = hostkey::derive("some-other-key");

        let err = resolve(
            &reg,
            &test_config(),
            "plainuser",
            stranger.public_key(),
        )
        .unwrap_err();
        assert!(matches!(err, AuthReject::MalformedUserName(_)));
    }

    #[test]
    fn test_resolve_no_such_devbox() {
        let reg = Registry::new();
        let stranger = hostkey::derive("some-other-key");

        let err = resolve(
            &reg,
            &test_config(),
            "alice.ns-db",
            stranger.public_key(),
        )
        .unwrap_err();
        assert_eq!(err, AuthReject::NoSuchDevbox);
    }

    #[test]
    fn test_resolve_devbox_not_running() {
        let reg = Registry::new();
        let private = hostkey::derive("devbox-key");
        reg.upsert_credential("ns", "db", private.public_key().clone(), Some(private));

        let stranger = hostkey::derive("some-other-key");
        let err = resolve(
            &reg,
            &test_config(),
            "alice.ns-db",
            stranger.public_key(),
        )
        .unwrap_err();
        assert_eq!(err, AuthReject::DevboxNotRunning);
    }
}
