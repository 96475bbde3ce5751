//! Cluster event projection.
//!
//! Watches devbox credential Secrets and Pods and projects add/update/delete
//! events into the routing registry. The watch layer is a thin shell over
//! pure projection functions, which carry all of the filtering and parsing
//! rules and are exercised directly by the tests.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::runtime::watcher::{self, watcher, Event};
use kube::Client;
use russh::keys::{decode_secret_key, PublicKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::registry::Registry;

/// Projects cluster events into the registry.
pub struct Projector {
    config: Arc<GatewayConfig>,
    registry: Arc<Registry>,
}

impl Projector {
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    /// Apply a credential Secret (added or updated).
    ///
    /// Non-devbox secrets are skipped silently. A secret without the public
    /// key field is an error; a private key that fails to parse is logged
    /// and the credential is stored without a signer.
    pub fn apply_secret(&self, secret: &Secret) -> Result<()> {
        if !self.matches_label(&secret.metadata) {
            return Ok(());
        }

        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        let name = secret.metadata.name.as_deref().unwrap_or_default();

        let devbox = self.devbox_owner(&secret.metadata).ok_or_else(|| {
            anyhow!("secret {namespace}/{name} has no {} owner", self.config.owner_kind)
        })?;

        let data = secret.data.as_ref().ok_or_else(|| {
            anyhow!(
                "secret {namespace}/{name} missing {}",
                self.config.public_key_field
            )
        })?;

        let public_key_data = data.get(&self.config.public_key_field).ok_or_else(|| {
            anyhow!(
                "secret {namespace}/{name} missing {}",
                self.config.public_key_field
            )
        })?;

        let public_key = parse_authorized_key(&public_key_data.0)
            .with_context(|| format!("secret {namespace}/{name}: invalid public key"))?;

        let private_key = data.get(&self.config.private_key_field).and_then(|pem| {
            match decode_secret_key(&String::from_utf8_lossy(&pem.0), None) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(
                        namespace,
                        devbox = %devbox,
                        "Failed to parse private key: {e}"
                    );
                    None
                }
            }
        });

        self.registry
            .upsert_credential(namespace, &devbox, public_key, private_key);
        Ok(())
    }

    /// Remove the credential for a deleted Secret.
    pub fn delete_secret(&self, secret: &Secret) {
        let Some(devbox) = self.devbox_owner(&secret.metadata) else {
            return;
        };
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        self.registry.remove_credential(namespace, &devbox);
    }

    /// Apply a Pod event (added or updated). Only the pod IP is consumed;
    /// a pod that has no IP yet contributes nothing.
    pub fn apply_pod(&self, pod: &Pod) -> Result<()> {
        if !self.matches_label(&pod.metadata) {
            return Ok(());
        }

        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();

        let devbox = self.devbox_owner(&pod.metadata).ok_or_else(|| {
            anyhow!("pod {namespace}/{name} has no {} owner", self.config.owner_kind)
        })?;

        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default();
        if pod_ip.is_empty() {
            // Pod not ready yet
            return Ok(());
        }

        self.registry.upsert_pod_ip(namespace, &devbox, pod_ip);
        Ok(())
    }

    /// Clear the pod IP for a deleted Pod; key material is untouched.
    pub fn delete_pod(&self, pod: &Pod) {
        let Some(devbox) = self.devbox_owner(&pod.metadata) else {
            return;
        };
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        self.registry.clear_pod_ip(namespace, &devbox);
    }

    fn matches_label(&self, metadata: &ObjectMeta) -> bool {
        metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.config.part_of_label))
            .map(|value| value == &self.config.part_of_value)
            .unwrap_or(false)
    }

    /// Walk the owner references and return the name of the first owner of
    /// the configured devbox kind.
    fn devbox_owner(&self, metadata: &ObjectMeta) -> Option<String> {
        metadata
            .owner_references
            .as_ref()?
            .iter()
            .find(|owner| owner.kind == self.config.owner_kind)
            .map(|owner| owner.name.clone())
    }
}

fn parse_authorized_key(data: &[u8]) -> Result<PublicKey> {
    let text = std::str::from_utf8(data).context("public key is not UTF-8")?;
    PublicKey::from_openssh(text.trim()).context("not an authorized-keys entry")
}

/// Start watchers for both resource types and wait until each has replayed
/// its initial state into the registry. Serving traffic before this would
/// reject valid users against an artificially empty routing table.
pub async fn start(client: Client, projector: Arc<Projector>) -> Result<()> {
    let selector = projector.config.label_selector();

    let (secrets_ready_tx, secrets_ready_rx) = oneshot::channel();
    let secrets: Api<Secret> = Api::all(client.clone());
    tokio::spawn(watch_secrets(
        secrets,
        selector.clone(),
        projector.clone(),
        secrets_ready_tx,
    ));

    let (pods_ready_tx, pods_ready_rx) = oneshot::channel();
    let pods: Api<Pod> = Api::all(client);
    tokio::spawn(watch_pods(pods, selector, projector, pods_ready_tx));

    secrets_ready_rx
        .await
        .map_err(|_| anyhow!("secret watcher stopped before initial sync"))?;
    pods_ready_rx
        .await
        .map_err(|_| anyhow!("pod watcher stopped before initial sync"))?;

    info!("Informer caches synced");
    Ok(())
}

async fn watch_secrets(
    api: Api<Secret>,
    selector: String,
    projector: Arc<Projector>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let stream = watcher(api, watcher::Config::default().labels(&selector));
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(secret)) | Ok(Event::InitApply(secret)) => {
                if let Err(e) = projector.apply_secret(&secret) {
                    warn!("Error applying secret: {e:#}");
                }
            }
            Ok(Event::Delete(secret)) => projector.delete_secret(&secret),
            Ok(Event::Init) => debug!("Secret watcher started"),
            Ok(Event::InitDone) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            Err(e) => {
                warn!("Secret watcher error, retrying: {e}");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

async fn watch_pods(
    api: Api<Pod>,
    selector: String,
    projector: Arc<Projector>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let stream = watcher(api, watcher::Config::default().labels(&selector));
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                if let Err(e) = projector.apply_pod(&pod) {
                    warn!("Error applying pod: {e:#}");
                }
            }
            Ok(Event::Delete(pod)) => projector.delete_pod(&pod),
            Ok(Event::Init) => debug!("Pod watcher started"),
            Ok(Event::InitDone) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            Err(e) => {
                warn!("Pod watcher error, retrying: {e}");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}
