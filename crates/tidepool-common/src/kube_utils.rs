//! Shared Kubernetes utilities using kube-rs
//!
//! Metadata construction, API resource building, client creation, and the
//! cancellable polling primitive used by every readiness wait.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

// =============================================================================
// ObjectMeta - Canonical metadata for every compiled resource
// =============================================================================

/// Standard Kubernetes ObjectMeta for compiled resources.
///
/// Automatically adds the tidepool management label on construction.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata with the tidepool management label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_TIDEPOOL.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Merge a set of labels
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

// =============================================================================
// ApiResource building
// =============================================================================

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from an apiVersion and kind
///
/// ```ignore
/// let ar = build_api_resource("apps/v1", "ReplicaSet");
/// let api: Api<DynamicObject> = Api::namespaced_with(client, "tidepool", &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Lowercase plural resource name for a kind, as the API server expects
///
/// Only regular English endings are handled. Custom resources carry their
/// declared plural and overwrite this.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    let sibilant = ["s", "x", "ch", "sh"].iter().any(|end| lower.ends_with(end));
    let consonant_y = lower
        .strip_suffix('y')
        .filter(|stem| !stem.ends_with(['a', 'e', 'o', 'u']));

    match (sibilant, consonant_y) {
        (true, _) => lower + "es",
        (false, Some(stem)) => format!("{stem}ies"),
        (false, None) => lower + "s",
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll until a condition is met, the deadline passes, or the wait is cancelled
///
/// `check_fn` returns `Ok(true)` when the condition is met and `Ok(false)` to
/// keep polling. A check error ends the wait immediately; there is no retry
/// within a wait. A `timeout` of `None` polls without a deadline, which is
/// only safe because `cancel` can still end the wait.
///
/// Both the deadline and cancellation surface as [`Error::Timeout`].
pub async fn poll_until<F, Fut>(
    instance: &str,
    operation: &str,
    interval: Duration,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = Instant::now();
    let deadline = timeout.map(|t| start + t);

    let expired = || async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    loop {
        let met = tokio::select! {
            result = check_fn() => result?,
            _ = cancel.cancelled() => {
                return Err(Error::timeout(instance, operation, start.elapsed()));
            }
            _ = expired() => {
                return Err(Error::timeout(instance, operation, start.elapsed()));
            }
        };

        if met {
            return Ok(());
        }
        trace!(instance = %instance, operation = %operation, "condition not yet met");

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                return Err(Error::timeout(instance, operation, start.elapsed()));
            }
            _ = expired() => {
                return Err(Error::timeout(instance, operation, start.elapsed()));
            }
        }
    }
}

// =============================================================================
// Clients and hashing
// =============================================================================

/// Connect timeout applied to every kube client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout applied to every kube client
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a kube client from `kubeconfig`, or the inferred in-cluster/local config
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let failed = |stage: &str, e: &dyn std::fmt::Display| {
        Error::internal_with_context("create_client", format!("{stage}: {e}"))
    };

    let mut config = if let Some(path) = kubeconfig {
        let raw = Kubeconfig::read_from(path).map_err(|e| failed("reading kubeconfig", &e))?;
        Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
            .await
            .map_err(|e| failed("loading kubeconfig", &e))?
    } else {
        Config::infer()
            .await
            .map_err(|e| failed("inferring config", &e))?
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| failed("building client", &e))
}

/// Compute a deterministic SHA-256 hex digest over a sequence of byte chunks.
///
/// Each chunk is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn deterministic_hash<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update((chunk.len() as u64).to_be_bytes());
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_build_api_resource_core_and_grouped() {
        let ar = build_api_resource("v1", "ConfigMap");
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "configmaps");

        let ar = build_api_resource("networking.k8s.io/v1", "NetworkPolicy");
        assert_eq!(ar.group, "networking.k8s.io");
        assert_eq!(ar.plural, "networkpolicies");

        let ar = build_api_resource("apps/v1", "ReplicaSet");
        assert_eq!(ar.plural, "replicasets");
    }

    #[test]
    fn test_pluralize_kind_endings() {
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
        assert_eq!(pluralize_kind("ServiceAccount"), "serviceaccounts");
        assert_eq!(pluralize_kind("Mesh"), "meshes");
    }

    #[test]
    fn test_object_meta_carries_management_label() {
        let meta = ObjectMeta::new("web-1234", "tidepool").with_label("app", "web-1234");
        assert_eq!(
            meta.labels.get(crate::LABEL_MANAGED_BY).map(String::as_str),
            Some(crate::LABEL_MANAGED_BY_TIDEPOOL)
        );
        assert_eq!(meta.labels.get("app").map(String::as_str), Some("web-1234"));
    }

    #[test]
    fn test_deterministic_hash_is_stable_and_chunk_aware() {
        let a = deterministic_hash([b"ab".as_slice(), b"c".as_slice()]);
        let b = deterministic_hash([b"ab".as_slice(), b"c".as_slice()]);
        let c = deterministic_hash([b"a".as_slice(), b"bc".as_slice()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds_when_condition_met() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        poll_until(
            "web",
            "readiness",
            Duration::from_secs(1),
            Some(Duration::from_secs(60)),
            &cancel,
            || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await
        .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out_at_deadline() {
        let start = Instant::now();
        let cancel = CancellationToken::new();

        let err = poll_until(
            "web",
            "readiness",
            Duration::from_secs(1),
            Some(Duration::from_secs(60)),
            &cancel,
            || async { Ok(false) },
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() <= Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_fails_fast_on_check_error() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let err = poll_until(
            "web",
            "readiness",
            Duration::from_secs(1),
            Some(Duration::from_secs(60)),
            &cancel,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::internal_with_context("test", "api unavailable"))
                }
            },
        )
        .await
        .unwrap_err();

        assert!(!err.is_timeout());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_poll_ends_on_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(300)).await;
            trigger.cancel();
        });

        let err = poll_until(
            "web",
            "stop",
            Duration::from_secs(1),
            None,
            &cancel,
            || async { Ok(false) },
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
    }
}
