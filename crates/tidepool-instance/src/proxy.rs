//! Ingress proxy collaborator
//!
//! A proxy exposes an instance port outside the cluster under a routable
//! prefix.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use tidepool_common::BoxError;

/// Registers routable hosts for instance ports
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Route `prefix` to `port` of the Service named `service`
    async fn add_host(&self, service: &str, prefix: &str, port: u16) -> Result<(), BoxError>;

    /// Externally reachable URL for a registered prefix
    async fn url(&self, prefix: &str) -> Result<String, BoxError>;
}

/// Prefix under which an instance port is registered
pub fn host_prefix(cluster_name: &str, port: u16) -> String {
    format!("{}-{}", cluster_name, port)
}
