//! Image construction collaborators
//!
//! An [`ImageBuilder`] opens a [`BuildContext`] from a base image or a git
//! source. The context accumulates changes (files, user) while an instance is
//! preparing, and is pushed under a generated name at commit time.

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use tidepool_common::kube_utils::deterministic_hash;
use tidepool_common::BoxError;

/// Git source for an image build
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GitContext {
    /// Repository URL
    pub repo: String,
    /// Branch to build
    pub branch: String,
    /// Specific commit, overrides the branch head
    pub commit: Option<String>,
    /// Access token for private repositories
    pub token: Option<String>,
}

impl GitContext {
    /// Deterministic image name for this source
    ///
    /// Two instances built from the same repository and revision resolve to
    /// the same name, so the second build can be skipped by the builder.
    pub fn image_name(&self, registry: &str) -> String {
        let revision = self.commit.as_deref().unwrap_or(&self.branch);
        let hash = deterministic_hash([self.repo.as_bytes(), revision.as_bytes()]);
        format!("{}/{}:latest", registry, &hash[..16])
    }
}

/// Opens build contexts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Start a build context from an existing image
    async fn open(&self, base_image: &str) -> Result<Arc<dyn BuildContext>, BoxError>;

    /// Build an image from a git source and start a context from the result
    async fn open_git(
        &self,
        git: &GitContext,
        image_name: &str,
    ) -> Result<Arc<dyn BuildContext>, BoxError>;
}

/// A mutable image build in progress
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BuildContext: Send + Sync {
    /// True if anything was added since the base image
    fn changed(&self) -> bool;

    /// Image the context was opened from
    fn base_image(&self) -> String;

    /// Deterministic hash of the base image plus every change
    fn content_hash(&self) -> Result<String, BoxError>;

    /// Build and push the image under `image_name`
    async fn push(&self, image_name: &str) -> Result<(), BoxError>;

    /// Bake a file into the image at `dest`, owned by `chown`
    async fn add_file(&self, contents: Vec<u8>, dest: &str, chown: &str) -> Result<(), BoxError>;

    /// Set the user the image runs as
    async fn set_user(&self, user: &str) -> Result<(), BoxError>;

    /// Run a command against the image being built
    async fn execute(&self, command: &[String]) -> Result<String, BoxError>;

    /// Read a file from the image being built
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, BoxError>;
}

/// Builder for prebuilt images that never change
///
/// Every context it opens reports no changes, so commit uses the base image
/// as-is. Any attempt to modify the image fails.
#[derive(Clone, Debug, Default)]
pub struct PassthroughBuilder;

#[async_trait]
impl ImageBuilder for PassthroughBuilder {
    async fn open(&self, base_image: &str) -> Result<Arc<dyn BuildContext>, BoxError> {
        Ok(Arc::new(PassthroughContext {
            image: base_image.to_string(),
        }))
    }

    async fn open_git(
        &self,
        git: &GitContext,
        _image_name: &str,
    ) -> Result<Arc<dyn BuildContext>, BoxError> {
        Err(format!("cannot build {} without an image builder", git.repo).into())
    }
}

struct PassthroughContext {
    image: String,
}

impl PassthroughContext {
    fn unsupported(&self, what: &str) -> BoxError {
        format!("{} is not supported for prebuilt image {}", what, self.image).into()
    }
}

#[async_trait]
impl BuildContext for PassthroughContext {
    fn changed(&self) -> bool {
        false
    }

    fn base_image(&self) -> String {
        self.image.clone()
    }

    fn content_hash(&self) -> Result<String, BoxError> {
        Ok(deterministic_hash([self.image.as_bytes()]))
    }

    async fn push(&self, _image_name: &str) -> Result<(), BoxError> {
        Err(self.unsupported("pushing"))
    }

    async fn add_file(&self, _contents: Vec<u8>, dest: &str, _chown: &str) -> Result<(), BoxError> {
        Err(self.unsupported(&format!("baking {}", dest)))
    }

    async fn set_user(&self, _user: &str) -> Result<(), BoxError> {
        Err(self.unsupported("setting the user"))
    }

    async fn execute(&self, _command: &[String]) -> Result<String, BoxError> {
        Err(self.unsupported("executing commands"))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, BoxError> {
        Err(self.unsupported(&format!("reading {}", path)))
    }
}
