//! Commit: freeze a preparing instance into an image reference
//!
//! An unchanged build context commits to its base image. A changed one is
//! looked up by content hash in the shared [`crate::cache::BuildCache`] and
//! only pushed on a miss.

use tracing::{debug, info};
use uuid::Uuid;

use crate::instance::InstanceId;
use crate::state::{InstanceState, Operation};
use crate::testbed::Testbed;
use tidepool_common::{Error, Settings};

/// Fresh image name under the configured registry, tagged with the TTL
pub fn generated_image_name(settings: &Settings) -> String {
    format!("{}/{}:{}", settings.image_registry, Uuid::new_v4(), settings.image_ttl)
}

impl Testbed {
    /// Freeze the image and move the instance to Committed
    pub async fn commit(&mut self, id: InstanceId) -> Result<(), Error> {
        let idx = self.index(id)?;
        let instance = &self.instances[idx];
        instance.guard(Operation::Commit)?;
        let name = instance.name().to_string();
        let operation = Operation::Commit.as_str();

        let ctx = instance
            .build_context
            .clone()
            .ok_or_else(|| Error::invariant(&name, "preparing instance has no build context"))?;

        let image = if !ctx.changed() {
            debug!(instance = %name, "Build context unchanged, using base image");
            ctx.base_image()
        } else {
            let hash = ctx
                .content_hash()
                .map_err(|e| Error::collaborator(&name, operation, e))?;
            match self.deps.cache.get(&hash) {
                Some(cached) => {
                    debug!(instance = %name, image = %cached, "Using cached image");
                    cached
                }
                None => {
                    let image_name = generated_image_name(&self.deps.settings);
                    debug!(instance = %name, image = %image_name, "No cached image, pushing");
                    ctx.push(&image_name)
                        .await
                        .map_err(|e| Error::collaborator(&name, operation, e))?;
                    self.deps.cache.insert(&hash, &image_name)
                }
            }
        };

        let instance = &mut self.instances[idx];
        info!(instance = %name, image = %image, "Committed instance");
        instance.image = Some(image);
        instance.state = InstanceState::Committed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::builder::{BuildContext, MockBuildContext, MockImageBuilder};
    use crate::test_support::Fixture;

    fn changed_context(hash: &'static str, pushes: Arc<AtomicUsize>) -> Arc<dyn BuildContext> {
        let mut ctx = MockBuildContext::new();
        ctx.expect_changed().return_const(true);
        ctx.expect_content_hash().returning(move || Ok(hash.to_string()));
        ctx.expect_push().returning(move |_| {
            pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Arc::new(ctx)
    }

    #[test]
    fn image_name_uses_registry_and_ttl() {
        let settings = Settings::default();
        let name = generated_image_name(&settings);
        assert!(name.starts_with("ttl.sh/"));
        assert!(name.ends_with(":24h"));
        assert_ne!(name, generated_image_name(&settings));
    }

    #[tokio::test]
    async fn unchanged_context_commits_base_image() {
        let mut testbed = Fixture::new().testbed();
        let id = testbed.create_instance("web").unwrap();
        testbed.set_image(id, "nginx:1.27").await.unwrap();
        testbed.commit(id).await.unwrap();

        let instance = testbed.instance(id).unwrap();
        assert_eq!(instance.state(), InstanceState::Committed);
        assert_eq!(instance.image(), Some("nginx:1.27"));
    }

    #[tokio::test]
    async fn identical_contexts_share_one_push() {
        let pushes = Arc::new(AtomicUsize::new(0));
        let contexts = vec![
            changed_context("abc", pushes.clone()),
            changed_context("abc", pushes.clone()),
        ];
        let contexts = std::sync::Mutex::new(contexts);

        let mut builder = MockImageBuilder::new();
        builder
            .expect_open()
            .times(2)
            .returning(move |_| Ok(contexts.lock().unwrap().remove(0)));
        let mut fixture = Fixture::new();
        fixture.builder = Some(builder);
        let cache = fixture.cache.clone();
        let mut testbed = fixture.testbed();

        let a = testbed.create_instance("a").unwrap();
        let b = testbed.create_instance("b").unwrap();
        for id in [a, b] {
            testbed.set_image(id, "alpine").await.unwrap();
            testbed.commit(id).await.unwrap();
        }

        let image_a = testbed.instance(a).unwrap().image().unwrap().to_string();
        let image_b = testbed.instance(b).unwrap().image().unwrap().to_string();
        assert_eq!(image_a, image_b);
        assert_eq!(pushes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("abc"), Some(image_a));
    }

    #[tokio::test]
    async fn push_failure_leaves_instance_preparing() {
        let mut ctx = MockBuildContext::new();
        ctx.expect_changed().return_const(true);
        ctx.expect_content_hash().returning(|| Ok("def".to_string()));
        ctx.expect_push()
            .returning(|_| Err("registry unavailable".into()));
        let ctx: Arc<dyn BuildContext> = Arc::new(ctx);

        let mut builder = MockImageBuilder::new();
        builder.expect_open().returning(move |_| Ok(ctx.clone()));
        let mut fixture = Fixture::new();
        fixture.builder = Some(builder);
        let cache = fixture.cache.clone();
        let mut testbed = fixture.testbed();

        let id = testbed.create_instance("web").unwrap();
        testbed.set_image(id, "alpine").await.unwrap();
        let err = testbed.commit(id).await.unwrap_err();
        assert!(err.to_string().contains("registry unavailable"));
        assert_eq!(testbed.instance(id).unwrap().state(), InstanceState::Preparing);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn commit_twice_is_a_state_violation() {
        let mut testbed = Fixture::new().testbed();
        let id = testbed.create_instance("web").unwrap();
        testbed.set_image(id, "nginx").await.unwrap();
        testbed.commit(id).await.unwrap();
        assert!(testbed.commit(id).await.unwrap_err().is_state_violation());
    }
}
