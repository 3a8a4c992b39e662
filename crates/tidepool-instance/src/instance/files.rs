//! Files added to an instance
//!
//! While preparing, files are baked into the image through the build context.
//! Once committed the image is frozen, so files are recorded on the descriptor
//! and deployed as a ConfigMap mounted at each destination path.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::Instance;
use crate::state::{InstanceState, Operation};
use tidepool_common::Error;

/// A file deployed with the instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceFile {
    /// Absolute destination path inside the container
    pub dest: String,
    /// Owning group (the gid half of `uid:gid`)
    pub group: i64,
    /// File contents
    pub contents: Vec<u8>,
    /// True if the file went into the image rather than a ConfigMap
    pub baked: bool,
}

/// Split a `uid:gid` owner into its parts
fn parse_chown(instance: &str, chown: &str) -> Result<(i64, i64), Error> {
    let invalid =
        || Error::validation_for(instance, format!("chown must be uid:gid, got {:?}", chown));
    let (uid, gid) = chown.split_once(':').ok_or_else(invalid)?;
    let uid = uid.parse::<i64>().map_err(|_| invalid())?;
    let gid = gid.parse::<i64>().map_err(|_| invalid())?;
    if uid < 0 || gid < 0 {
        return Err(invalid());
    }
    Ok((uid, gid))
}

impl Instance {
    /// Add a file with the given contents at `dest`, owned by `chown` (`uid:gid`)
    pub async fn add_file_bytes(
        &mut self,
        contents: Vec<u8>,
        dest: &str,
        chown: &str,
    ) -> Result<(), Error> {
        self.guard(Operation::AddFile)?;
        self.insert_file(contents, dest, chown).await
    }

    /// Add a local file at `dest`, owned by `chown` (`uid:gid`)
    pub async fn add_file(
        &mut self,
        src: impl AsRef<Path>,
        dest: &str,
        chown: &str,
    ) -> Result<(), Error> {
        self.guard(Operation::AddFile)?;
        let src = src.as_ref();
        let contents = tokio::fs::read(src)
            .await
            .map_err(|e| Error::collaborator(self.name(), format!("read {}", src.display()), e))?;
        self.insert_file(contents, dest, chown).await
    }

    /// Add every file under a local directory, mirrored below `dest`
    ///
    /// Every file is read and validated first; a rejected call records none.
    pub async fn add_folder(
        &mut self,
        src: impl AsRef<Path>,
        dest: &str,
        chown: &str,
    ) -> Result<(), Error> {
        self.guard(Operation::AddFolder)?;
        let root = src.as_ref();
        let dest_root = dest.trim_end_matches('/');

        let mut found = Vec::new();
        let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let read_failed = |e: std::io::Error| {
                Error::collaborator(self.name(), format!("read {}", dir.display()), e)
            };
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(read_failed)?;
            while let Some(entry) = entries.next_entry().await.map_err(read_failed)? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| {
                    Error::collaborator(self.name(), format!("stat {}", path.display()), e)
                })?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    found.push(path);
                }
            }
        }
        found.sort();

        // read and validate everything before recording anything
        let mut batch = Vec::with_capacity(found.len());
        for path in found {
            let relative = path.strip_prefix(root).map_err(|e| {
                Error::internal_with_context(
                    "add_folder",
                    format!("{} outside {}: {}", path.display(), root.display(), e),
                )
            })?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let file_dest = format!("{}/{}", dest_root, relative);
            let contents = tokio::fs::read(&path).await.map_err(|e| {
                Error::collaborator(self.name(), format!("read {}", path.display()), e)
            })?;
            self.check_file(&file_dest, chown)?;
            batch.push((file_dest, contents));
        }

        for (file_dest, contents) in batch {
            self.insert_file(contents, &file_dest, chown).await?;
        }
        Ok(())
    }

    /// Set the user the image runs as
    pub async fn set_user(&mut self, user: &str) -> Result<(), Error> {
        self.guard(Operation::SetUser)?;
        let ctx = self.build_context.clone().ok_or_else(|| {
            Error::invariant(self.name(), "preparing instance has no build context")
        })?;
        ctx.set_user(user)
            .await
            .map_err(|e| Error::collaborator(self.name(), Operation::SetUser.as_str(), e))?;
        debug!(instance = %self.name(), user = %user, "Set user");
        Ok(())
    }

    /// Validate a destination and owner against the files already recorded
    ///
    /// Returns the owning group.
    fn check_file(&self, dest: &str, chown: &str) -> Result<i64, Error> {
        if !dest.starts_with('/') {
            return Err(Error::validation_for(
                self.name(),
                format!("file destination {} must be absolute", dest),
            ));
        }
        if self.files.iter().any(|f| f.dest == dest) {
            return Err(Error::validation_for(
                self.name(),
                format!("a file already exists at {}", dest),
            ));
        }
        let (_, group) = parse_chown(self.name(), chown)?;

        // Deployed files share one ConfigMap volume, so they share its fsGroup
        if self.state != InstanceState::Preparing {
            if let Some(existing) = self.fs_group.filter(|existing| *existing != group) {
                return Err(Error::validation_for(
                    self.name(),
                    format!(
                        "all files must share one group: {} has group {}, existing files use {}",
                        dest, group, existing
                    ),
                ));
            }
        }
        Ok(group)
    }

    async fn insert_file(
        &mut self,
        contents: Vec<u8>,
        dest: &str,
        chown: &str,
    ) -> Result<(), Error> {
        let group = self.check_file(dest, chown)?;

        if self.state == InstanceState::Preparing {
            let ctx = self.build_context.clone().ok_or_else(|| {
                Error::invariant(self.name(), "preparing instance has no build context")
            })?;
            ctx.add_file(contents.clone(), dest, chown)
                .await
                .map_err(|e| Error::collaborator(self.name(), Operation::AddFile.as_str(), e))?;
            debug!(instance = %self.name(), dest = %dest, "Baked file into image");
            self.files.push(InstanceFile {
                dest: dest.to_string(),
                group,
                contents,
                baked: true,
            });
            return Ok(());
        }

        self.fs_group = Some(group);
        debug!(instance = %self.name(), dest = %dest, size = contents.len(), "Added file");
        self.files.push(InstanceFile {
            dest: dest.to_string(),
            group,
            contents,
            baked: false,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::builder::MockBuildContext;
    use crate::instance::InstanceId;

    fn instance_in(state: InstanceState) -> Instance {
        let mut instance = Instance::new(InstanceId(0), "web", "web-00000000");
        instance.state = state;
        instance
    }

    #[test]
    fn chown_parsing() {
        assert_eq!(parse_chown("web", "1000:2000").unwrap(), (1000, 2000));
        assert!(parse_chown("web", "1000").is_err());
        assert!(parse_chown("web", "root:root").is_err());
        assert!(parse_chown("web", "-1:0").is_err());
    }

    #[tokio::test]
    async fn committed_files_are_recorded_with_shared_group() {
        let mut instance = instance_in(InstanceState::Committed);
        instance
            .add_file_bytes(b"a".to_vec(), "/etc/app/a.conf", "0:1000")
            .await
            .unwrap();
        instance
            .add_file_bytes(b"b".to_vec(), "/etc/app/b.conf", "1:1000")
            .await
            .unwrap();
        assert_eq!(instance.fs_group(), Some(1000));
        assert_eq!(instance.files().count(), 2);

        let err = instance
            .add_file_bytes(b"c".to_vec(), "/etc/app/c.conf", "0:0")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("share one group"));
        assert_eq!(instance.files().count(), 2);
    }

    #[tokio::test]
    async fn duplicate_destination_is_rejected() {
        let mut instance = instance_in(InstanceState::Committed);
        instance.add_file_bytes(b"a".to_vec(), "/a", "0:0").await.unwrap();
        assert!(instance.add_file_bytes(b"b".to_vec(), "/a", "0:0").await.is_err());
        assert!(instance.add_file_bytes(b"b".to_vec(), "relative", "0:0").await.is_err());
    }

    #[tokio::test]
    async fn preparing_files_are_baked() {
        let mut ctx = MockBuildContext::new();
        ctx.expect_add_file().times(1).returning(|contents, dest, chown| {
            assert_eq!(contents, b"hi".to_vec());
            assert_eq!(dest, "/motd");
            assert_eq!(chown, "0:0");
            Ok(())
        });

        let mut instance = instance_in(InstanceState::Preparing);
        instance.build_context = Some(Arc::new(ctx));
        instance.add_file_bytes(b"hi".to_vec(), "/motd", "0:0").await.unwrap();

        // baked files are not deployed through a ConfigMap
        assert_eq!(instance.files().count(), 0);
        assert!(instance.fs_group().is_none());
    }

    #[tokio::test]
    async fn set_user_only_while_preparing() {
        let mut ctx = MockBuildContext::new();
        ctx.expect_set_user().times(1).returning(|_| Ok(()));

        let mut instance = instance_in(InstanceState::Preparing);
        instance.build_context = Some(Arc::new(ctx));
        instance.set_user("1000").await.unwrap();

        instance.state = InstanceState::Committed;
        assert!(instance.set_user("1000").await.unwrap_err().is_state_violation());
    }

    #[tokio::test]
    async fn rejected_folder_leaves_descriptor_unchanged() {
        let dir = std::env::temp_dir().join(format!("tidepool-folder-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(dir.join("conf.d")).await.unwrap();
        tokio::fs::write(dir.join("a.conf"), b"a").await.unwrap();
        tokio::fs::write(dir.join("conf.d/b.conf"), b"b").await.unwrap();

        let mut instance = instance_in(InstanceState::Committed);
        instance
            .add_file_bytes(b"x".to_vec(), "/etc/app/conf.d/b.conf", "0:1000")
            .await
            .unwrap();

        // a.conf sorts first and is valid; b.conf collides
        let err = instance.add_folder(&dir, "/etc/app/", "0:1000").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(instance.files().count(), 1);

        // group mismatch is caught before any file is recorded
        let err = instance.add_folder(&dir, "/srv", "0:0").await.unwrap_err();
        assert!(err.to_string().contains("share one group"));
        assert_eq!(instance.files().count(), 1);

        instance.add_folder(&dir, "/srv", "0:1000").await.unwrap();
        let dests: Vec<&str> = instance.files().map(|f| f.dest.as_str()).collect();
        assert_eq!(
            dests,
            vec!["/etc/app/conf.d/b.conf", "/srv/a.conf", "/srv/conf.d/b.conf"]
        );

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn started_rejects_files() {
        let mut instance = instance_in(InstanceState::Started);
        let err = instance.add_file_bytes(b"a".to_vec(), "/a", "0:0").await.unwrap_err();
        assert!(err.is_state_violation());
        assert_eq!(instance.files().count(), 0);
    }
}
