//! In-memory routing registry.
//!
//! Maps SSH key fingerprints and (namespace, devbox) identities to the
//! routing record for a devbox. The registry is a pure projection of the
//! cluster event stream: credential events carry key material, pod events
//! carry the current pod IP, and nothing is ever expired by time.

use russh::keys::{PrivateKey, PublicKey};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::auth::fingerprint;

/// Routing record for a single devbox.
///
/// Records are immutable once published; the registry replaces the whole
/// record on every write, so a reader's snapshot never changes under it.
#[derive(Debug, Clone)]
pub struct DevboxInfo {
    pub namespace: String,
    pub devbox_name: String,

    /// Current pod IP; empty while no pod is running.
    pub pod_ip: String,

    /// Public key from the devbox credential secret.
    pub public_key: Option<PublicKey>,

    /// Signer used to dial the backend in public-key mode. Absent when the
    /// credential secret carries no (parseable) private key.
    pub private_key: Option<Arc<PrivateKey>>,

    /// SHA-256 fingerprint of `public_key`; empty until a credential arrives.
    pub fingerprint: String,
}

impl DevboxInfo {
    fn shell(namespace: &str, devbox_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            devbox_name: devbox_name.to_string(),
            pod_ip: String::new(),
            public_key: None,
            private_key: None,
            fingerprint: String::new(),
        }
    }
}

#[derive(Default)]
struct Indexes {
    /// fingerprint -> DevboxInfo
    by_fingerprint: HashMap<String, Arc<DevboxInfo>>,
    /// "namespace/devbox" -> DevboxInfo
    by_name: HashMap<String, Arc<DevboxInfo>>,
}

impl Indexes {
    /// Replace the record under its composite key and re-point the
    /// fingerprint index at the new record. Must run under the write lock so
    /// a stale fingerprint is never observable.
    fn publish(&mut self, prior_fingerprint: Option<&str>, info: DevboxInfo) {
        if let Some(prior) = prior_fingerprint {
            if !prior.is_empty() && prior != info.fingerprint {
                self.by_fingerprint.remove(prior);
            }
        }

        let info = Arc::new(info);
        if !info.fingerprint.is_empty() {
            self.by_fingerprint
                .insert(info.fingerprint.clone(), info.clone());
        }
        self.by_name
            .insert(composite_key(&info.namespace, &info.devbox_name), info);
    }
}

/// Concurrency-safe double index over devbox routing records.
///
/// A single lock guards both maps: key rotation has to retire the previous
/// fingerprint entry and insert the new one in one critical section.
pub struct Registry {
    inner: RwLock<Indexes>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Install or refresh the key material for a devbox, creating the record
    /// on first sight. A changed public key atomically retires the previous
    /// fingerprint-index entry.
    pub fn upsert_credential(
        &self,
        namespace: &str,
        devbox_name: &str,
        public_key: PublicKey,
        private_key: Option<PrivateKey>,
    ) {
        let fp = fingerprint(&public_key);
        info!(
            namespace,
            devbox = devbox_name,
            fingerprint = %fp,
            "Adding credential"
        );

        let key = composite_key(namespace, devbox_name);
        let mut indexes = self.inner.write().expect("registry lock poisoned");

        let prior = indexes.by_name.get(&key).cloned();
        let mut info = match &prior {
            Some(existing) => (**existing).clone(),
            None => DevboxInfo::shell(namespace, devbox_name),
        };
        info.public_key = Some(public_key);
        info.private_key = private_key.map(Arc::new);
        info.fingerprint = fp;

        indexes.publish(prior.as_ref().map(|p| p.fingerprint.as_str()), info);
    }

    /// Remove a devbox from both indexes.
    pub fn remove_credential(&self, namespace: &str, devbox_name: &str) {
        info!(namespace, devbox = devbox_name, "Removing credential");

        let key = composite_key(namespace, devbox_name);
        let mut indexes = self.inner.write().expect("registry lock poisoned");

        if let Some(info) = indexes.by_name.remove(&key) {
            if !info.fingerprint.is_empty() {
                indexes.by_fingerprint.remove(&info.fingerprint);
            }
        }
    }

    /// Record the pod IP for a devbox, creating a shell record if the
    /// credential has not been seen yet.
    pub fn upsert_pod_ip(&self, namespace: &str, devbox_name: &str, pod_ip: &str) {
        info!(namespace, devbox = devbox_name, pod_ip, "Updating pod IP");

        let key = composite_key(namespace, devbox_name);
        let mut indexes = self.inner.write().expect("registry lock poisoned");

        let prior = indexes.by_name.get(&key).cloned();
        let mut info = match &prior {
            Some(existing) => (**existing).clone(),
            None => DevboxInfo::shell(namespace, devbox_name),
        };
        info.pod_ip = pod_ip.to_string();

        indexes.publish(prior.as_ref().map(|p| p.fingerprint.as_str()), info);
    }

    /// Clear the pod IP for a devbox; key material is preserved so the
    /// devbox keeps its identity across pod restarts.
    pub fn clear_pod_ip(&self, namespace: &str, devbox_name: &str) {
        info!(namespace, devbox = devbox_name, "Clearing pod IP");
        self.upsert_pod_ip(namespace, devbox_name, "");
    }

    pub fn lookup_by_fingerprint(&self, fp: &str) -> Option<Arc<DevboxInfo>> {
        let indexes = self.inner.read().expect("registry lock poisoned");
        indexes.by_fingerprint.get(fp).cloned()
    }

    pub fn lookup_by_name(&self, namespace: &str, devbox_name: &str) -> Option<Arc<DevboxInfo>> {
        let indexes = self.inner.read().expect("registry lock poisoned");
        indexes
            .by_name
            .get(&composite_key(namespace, devbox_name))
            .cloned()
    }

    #[cfg(test)]
    fn index_sizes(&self) -> (usize, usize) {
        let indexes = self.inner.read().expect("registry lock poisoned");
        (indexes.by_fingerprint.len(), indexes.by_name.len())
    }
}

fn composite_key(namespace: &str, devbox_name: &str) -> String {
    format!("{namespace}/{devbox_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostkey;

    fn test_keypair(seed: &str) -> (PublicKey, PrivateKey) {
        let private = hostkey::derive(seed);
        (private.public_key().clone(), private)
    }

    #[test]
    fn test_fingerprint_index_follows_name_index() {
        let reg = Registry::new();
        let (public, private) = test_keypair("k1");
        let fp = fingerprint(&public);

        reg.upsert_credential("ns", "db", public, Some(private));

        let by_fp = reg.lookup_by_fingerprint(&fp).expect("fingerprint entry");
        let by_name = reg.lookup_by_name("ns", "db").expect("name entry");
        assert_eq!(by_fp.fingerprint, fp);
        assert_eq!(by_name.fingerprint, fp);
        assert_eq!(by_fp.namespace, "ns");
        assert_eq!(by_fp.devbox_name, "db");
        assert!(Arc::ptr_eq(&by_fp, &by_name));
    }

    #[test]
    fn test_key_rotation_retires_old_fingerprint() {
        let reg = Registry::new();
        let (old_public, old_private) = test_keypair("old");
        let (new_public, new_private) = test_keypair("new");
        let old_fp = fingerprint(&old_public);
        let new_fp = fingerprint(&new_public);

        reg.upsert_credential("ns", "db", old_public, Some(old_private));
        reg.upsert_credential("ns", "db", new_public, Some(new_private));

        assert!(reg.lookup_by_fingerprint(&old_fp).is_none());
        let info = reg.lookup_by_fingerprint(&new_fp).expect("rotated entry");
        assert_eq!(info.fingerprint, new_fp);
        assert_eq!(reg.index_sizes(), (1, 1));
    }

    #[test]
    fn test_pod_delete_preserves_credential() {
        let reg = Registry::new();
        let (public, private) = test_keypair("k1");
        let fp = fingerprint(&public);

        reg.upsert_credential("ns", "db", public, Some(private));
        reg.upsert_pod_ip("ns", "db", "10.0.0.5");
        reg.clear_pod_ip("ns", "db");

        let info = reg.lookup_by_fingerprint(&fp).expect("credential survives");
        assert_eq!(info.pod_ip, "");
        assert!(info.private_key.is_some());
    }

    #[test]
    fn test_reapply_credential_is_noop() {
        let reg = Registry::new();
        let (public, private) = test_keypair("k1");
        let fp = fingerprint(&public);

        reg.upsert_credential("ns", "db", public.clone(), Some(private.clone()));
        reg.upsert_pod_ip("ns", "db", "10.0.0.5");
        reg.upsert_credential("ns", "db", public, Some(private));

        assert_eq!(reg.index_sizes(), (1, 1));
        let info = reg.lookup_by_fingerprint(&fp).expect("still present");
        assert_eq!(info.fingerprint, fp);
        assert_eq!(info.pod_ip, "10.0.0.5");
    }

    #[test]
    fn test_pod_restart_preserves_identity() {
        let reg = Registry::new();
        let (public, private) = test_keypair("k1");
        let fp = fingerprint(&public);

        reg.upsert_credential("ns", "db", public, Some(private));
        reg.upsert_pod_ip("ns", "db", "10.0.0.5");
        reg.clear_pod_ip("ns", "db");
        reg.upsert_pod_ip("ns", "db", "10.0.0.9");

        let info = reg.lookup_by_fingerprint(&fp).expect("identity preserved");
        assert_eq!(info.pod_ip, "10.0.0.9");
        assert_eq!(info.namespace, "ns");
        assert_eq!(info.devbox_name, "db");
    }

    #[test]
    fn test_pod_event_before_credential_creates_shell_record() {
        let reg = Registry::new();
        reg.upsert_pod_ip("ns", "db", "10.0.0.5");

        let info = reg.lookup_by_name("ns", "db").expect("shell record");
        assert_eq!(info.pod_ip, "10.0.0.5");
        assert!(info.public_key.is_none());
        assert!(info.fingerprint.is_empty());
        assert_eq!(reg.index_sizes(), (0, 1));

        let (public, private) = test_keypair("k1");
        let fp = fingerprint(&public);
        reg.upsert_credential("ns", "db", public, Some(private));

        let info = reg.lookup_by_fingerprint(&fp).expect("enriched record");
        assert_eq!(info.pod_ip, "10.0.0.5");
    }

    #[test]
    fn test_remove_credential_clears_both_indexes() {
        let reg = Registry::new();
        let (public, private) = test_keypair("k1");
        let fp = fingerprint(&public);

        reg.upsert_credential("ns", "db", public, Some(private));
        reg.remove_credential("ns", "db");

        assert!(reg.lookup_by_fingerprint(&fp).is_none());
        assert!(reg.lookup_by_name("ns", "db").is_none());
        assert_eq!(reg.index_sizes(), (0, 0));
    }
}
