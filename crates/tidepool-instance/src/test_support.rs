//! Shared fixtures for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::builder::MockImageBuilder;
use crate::cache::BuildCache;
use crate::cluster::MockClusterClient;
use crate::fault::MockFaultInjectionClient;
use crate::instance::InstanceId;
use crate::names::{sanitize, NameGenerator};
use crate::proxy::MockProxy;
use crate::testbed::{Dependencies, Testbed};
use tidepool_common::{Error, Settings};

/// Predictable names: `<name>-<8 hex digit counter>`
#[derive(Default)]
pub(crate) struct SequentialNames {
    next: AtomicUsize,
}

impl NameGenerator for SequentialNames {
    fn generate(&self, name: &str) -> Result<String, Error> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-{:08x}", sanitize(name), n))
    }
}

/// Mock collaborators, set expectations then call [`Fixture::testbed`]
///
/// Without a builder mock the passthrough builder is used, so committed
/// instances keep their base image.
pub(crate) struct Fixture {
    pub cluster: MockClusterClient,
    pub builder: Option<MockImageBuilder>,
    pub fault: Option<MockFaultInjectionClient>,
    pub proxy: Option<MockProxy>,
    pub cache: Arc<BuildCache>,
    pub settings: Settings,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            cluster: MockClusterClient::new(),
            builder: None,
            fault: None,
            proxy: None,
            cache: Arc::new(BuildCache::new()),
            settings: Settings::default(),
        }
    }

    /// Accept any apply and report replica sets ready
    pub fn expect_deploy(&mut self) {
        self.cluster.expect_apply().returning(|_| Ok(()));
        self.cluster.expect_replica_set_ready().returning(|_| Ok(true));
    }

    pub fn testbed(self) -> Testbed {
        let mut deps = Dependencies::new(Arc::new(self.cluster), self.settings)
            .with_name_generator(Arc::new(SequentialNames::default()))
            .with_cache(self.cache);
        if let Some(builder) = self.builder {
            deps = deps.with_builder(Arc::new(builder));
        }
        if let Some(fault) = self.fault {
            deps = deps.with_fault_client(Arc::new(fault));
        }
        if let Some(proxy) = self.proxy {
            deps = deps.with_proxy(Arc::new(proxy));
        }
        Testbed::new(deps)
    }
}

/// Create, set image and commit an instance
pub(crate) async fn committed(testbed: &mut Testbed, name: &str, image: &str) -> InstanceId {
    let id = testbed.create_instance(name).unwrap();
    testbed.set_image(id, image).await.unwrap();
    testbed.commit(id).await.unwrap();
    id
}
