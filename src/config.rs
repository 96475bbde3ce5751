//! Gateway configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Seed for deterministic host key derivation. All replicas sharing the
    /// seed present the same host identity. Overridable via SSH_HOST_KEY_SEED.
    pub host_key_seed: String,

    /// Prefix prepended to the short namespace suffix encoded in SSH
    /// usernames ("user.suffix-devbox") to form the full namespace.
    pub namespace_prefix: String,

    /// Label key identifying devbox resources.
    pub part_of_label: String,

    /// Expected value of the part-of label.
    pub part_of_value: String,

    /// Owner-reference kind naming the parent devbox resource.
    pub owner_kind: String,

    /// Secret data field holding the authorized-keys public key.
    pub public_key_field: String,

    /// Secret data field holding the PEM private key.
    pub private_key_field: String,

    /// SSH port on the backend pods.
    pub backend_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_seed: "sealos-devbox".to_string(),
            namespace_prefix: "ns-".to_string(),
            part_of_label: "app.kubernetes.io/part-of".to_string(),
            part_of_value: "devbox".to_string(),
            owner_kind: "Devbox".to_string(),
            public_key_field: "SEALOS_DEVBOX_PUBLIC_KEY".to_string(),
            private_key_field: "SEALOS_DEVBOX_PRIVATE_KEY".to_string(),
            backend_port: 22,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Label selector string for watching devbox resources.
    pub fn label_selector(&self) -> String {
        format!("{}={}", self.part_of_label, self.part_of_value)
    }
}
