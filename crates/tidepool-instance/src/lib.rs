//! Ephemeral test workloads on Kubernetes
//!
//! A [`Testbed`] is a registry of instances. Each instance is described
//! through a builder-style API, frozen into an image by
//! [`Testbed::commit`], and deployed as a single-replica ReplicaSet by
//! [`Testbed::start`]. While running it can be shaped, isolated, exec'd into
//! and port-forwarded.
//!
//! ```rust,ignore
//! let cluster = KubeClusterClient::new(create_client(None).await?, &settings.namespace);
//! let mut testbed = Testbed::new(Dependencies::new(Arc::new(cluster), settings));
//!
//! let web = testbed.create_instance("web")?;
//! testbed.set_image(web, "nginx:1.27").await?;
//! testbed.commit(web).await?;
//! testbed.instance_mut(web)?.add_port_tcp(80)?;
//! testbed.start(web).await?;
//! let ip = testbed.address(web).await?;
//! ```
//!
//! Collaborators (cluster, image builder, fault sidecar, proxy, names) are
//! traits so tests can run without a cluster.

pub mod builder;
pub mod cache;
pub mod cluster;
mod commit;
pub mod compiler;
mod deploy;
pub mod fault;
pub mod instance;
pub mod k8s;
pub mod names;
mod portforward;
pub mod proxy;
mod sidecar;
pub mod state;
pub mod testbed;

#[cfg(test)]
mod test_support;

pub use builder::{BuildContext, GitContext, ImageBuilder, PassthroughBuilder};
pub use cache::BuildCache;
pub use cluster::{ClusterClient, CustomResourceType, KubeClusterClient};
pub use commit::generated_image_name;
pub use fault::{FaultClientError, FaultInjectionClient, ShapingKind};
pub use instance::{Instance, InstanceId, InstanceType};
pub use k8s::{PolicyRule, ProbeSpec};
pub use names::{NameGenerator, RandomNameGenerator};
pub use proxy::Proxy;
pub use state::{InstanceState, Operation};
pub use testbed::{Dependencies, Testbed};

// Re-export common types
pub use tidepool_common::{Error, Result, Settings};
