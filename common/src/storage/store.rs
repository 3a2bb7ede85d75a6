use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nix::unistd::{chown, Gid, Uid};
use tracing::{error, warn};

use crate::controllers::identity::{ExternalUser, UserAuthentication};
use crate::error::AppError;
use crate::storage::types::external_user_mapping::ExternalUserMapping;
use crate::storage::types::workspace::{FileEntry, WorkspaceFiles};

/// Workspace file storage. All paths are relative to [`StorageController::root_dir`].
#[async_trait]
pub trait StorageController: Send + Sync {
    fn name(&self) -> &str;

    fn root_dir(&self) -> &Path;

    /// Identity provider whose accounts own files in this storage.
    fn user_authentication(&self) -> &Arc<dyn UserAuthentication>;

    /// True when `path` resolves strictly below the root directory.
    fn is_valid_path(&self, path: &str) -> bool {
        match resolve_below(self.root_dir(), path) {
            Some(resolved) => resolved != normalize(self.root_dir()),
            None => false,
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root_dir().join(path)
    }

    async fn create_dir(&self, path: &str) -> Result<(), AppError>;

    async fn delete_dir(&self, path: &str, owner: &ExternalUserMapping) -> Result<(), AppError>;

    async fn set_ownership(
        &self,
        path: &str,
        owner: &ExternalUserMapping,
        recursive: bool,
    ) -> Result<(), AppError>;

    /// Total size of regular files below `path`, not following symlinks.
    async fn get_dir_size(&self, path: &str) -> Result<u64, AppError>;

    /// Files and symlinks below `path`, ignoring dot entries.
    async fn get_dir_tree(&self, path: &str) -> Result<WorkspaceFiles, AppError>;

    async fn create_file(&self, path: &str, name: &str, content: &[u8]) -> Result<(), AppError>;

    async fn create_symlink(&self, path: &str, name: &str, source: &Path) -> Result<(), AppError>;
}

/// Lexically normalizes `path`, dropping `.` and folding `..` into its parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Joins `relative` onto `root` and returns it if it stays inside `root`.
fn resolve_below(root: &Path, relative: &str) -> Option<PathBuf> {
    let root = normalize(root);
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|component| matches!(component, Component::Prefix(_)))
    {
        return None;
    }
    let joined = normalize(&root.join(relative));
    joined.starts_with(&root).then_some(joined)
}

/// Plain directory tree on the local filesystem, owned by OS accounts.
pub struct LocalFileSystemStorage {
    name: String,
    root_dir: PathBuf,
    user_authentication: Arc<dyn UserAuthentication>,
}

impl LocalFileSystemStorage {
    pub fn new(
        name: impl Into<String>,
        root_dir: PathBuf,
        user_authentication: Arc<dyn UserAuthentication>,
    ) -> Self {
        Self {
            name: name.into(),
            root_dir,
            user_authentication,
        }
    }

    fn checked_path(&self, path: &str) -> Result<PathBuf, AppError> {
        if self.is_valid_path(path) {
            Ok(self.full_path(path))
        } else {
            error!(path, root = %self.root_dir.display(), "Path is not a child of the storage root");
            Err(AppError::Storage(format!("Invalid path specified {path}")))
        }
    }

    async fn owner(&self, mapping: &ExternalUserMapping) -> Result<ExternalUser, AppError> {
        self.user_authentication.resolve_mapping(mapping).await
    }
}

#[async_trait]
impl StorageController for LocalFileSystemStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn user_authentication(&self) -> &Arc<dyn UserAuthentication> {
        &self.user_authentication
    }

    async fn create_dir(&self, path: &str) -> Result<(), AppError> {
        let full = self.checked_path(path)?;
        tokio::fs::create_dir_all(full).await?;
        Ok(())
    }

    async fn delete_dir(&self, path: &str, owner: &ExternalUserMapping) -> Result<(), AppError> {
        let full = self
            .checked_path(path)
            .map_err(|_| AppError::Storage("Cannot delete this workspace".into()))?;
        let external = self.owner(owner).await?;

        let metadata = match tokio::fs::metadata(&full).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if metadata.uid() != external.uid {
            return Err(AppError::Storage(format!(
                "User {} does not own {path}",
                external.username
            )));
        }

        tokio::fs::remove_dir_all(full).await?;
        Ok(())
    }

    async fn set_ownership(
        &self,
        path: &str,
        owner: &ExternalUserMapping,
        recursive: bool,
    ) -> Result<(), AppError> {
        let full = self.checked_path(path)?;
        let external = self.owner(owner).await?;
        let uid = Uid::from_raw(external.uid);
        let gid = Gid::from_raw(external.gid);

        tokio::task::spawn_blocking(move || -> Result<(), AppError> {
            chown(&full, Some(uid), Some(gid))?;
            if recursive {
                chown_tree(&full, uid, gid)?;
            }
            Ok(())
        })
        .await?
    }

    async fn get_dir_size(&self, path: &str) -> Result<u64, AppError> {
        let full = self.full_path(path);
        Ok(tokio::task::spawn_blocking(move || dir_size(&full)).await?)
    }

    async fn get_dir_tree(&self, path: &str) -> Result<WorkspaceFiles, AppError> {
        let full = self.full_path(path);
        tokio::task::spawn_blocking(move || {
            let mut files = WorkspaceFiles::default();
            collect_tree(&full, Path::new(""), &mut files)?;
            files.files.sort_by(|a, b| a.name.cmp(&b.name));
            files.symlinks.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(files)
        })
        .await?
    }

    async fn create_file(&self, path: &str, name: &str, content: &[u8]) -> Result<(), AppError> {
        let relative = Path::new(path).join(name);
        let full = self
            .checked_path(&relative.to_string_lossy())
            .map_err(|_| AppError::Storage(format!("Invalid file path specified {name}")))?;

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, content).await?;
        Ok(())
    }

    async fn create_symlink(&self, path: &str, name: &str, source: &Path) -> Result<(), AppError> {
        let relative = Path::new(path).join(name);
        let full = self.checked_path(&relative.to_string_lossy()).map_err(|_| {
            AppError::Storage(format!("Invalid symlink destination path specified {name}"))
        })?;

        if !tokio::fs::try_exists(source).await? {
            return Err(AppError::Storage(format!(
                "Symlink source {} does not exist",
                source.display()
            )));
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::symlink_metadata(&full).await.is_ok() {
            tokio::fs::remove_file(&full).await?;
        }
        tokio::fs::symlink(source, full).await?;
        Ok(())
    }
}

fn chown_tree(dir: &Path, uid: Uid, gid: Gid) -> Result<(), AppError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        chown(&entry.path(), Some(uid), Some(gid))?;
        if file_type.is_dir() {
            chown_tree(&entry.path(), uid, gid)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return 0,
    };
    if metadata.is_file() {
        return metadata.len();
    }
    if !metadata.is_dir() {
        return 0;
    }

    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Unable to read directory");
            return 0;
        }
    };

    entries
        .filter_map(Result::ok)
        .map(|entry| dir_size(&entry.path()))
        .sum()
}

fn collect_tree(dir: &Path, prefix: &Path, out: &mut WorkspaceFiles) -> Result<(), AppError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }
        let relative = prefix.join(&file_name);
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            out.symlinks.push(FileEntry {
                name: relative.to_string_lossy().into_owned(),
            });
        } else if file_type.is_dir() {
            collect_tree(&entry.path(), &relative, out)?;
        } else {
            out.files.push(FileEntry {
                name: relative.to_string_lossy().into_owned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::identity::ExternalUserQuery;
    use crate::storage::types::user::User;

    struct CurrentUserAuth;

    #[async_trait]
    impl UserAuthentication for CurrentUserAuth {
        fn name(&self) -> &str {
            "test"
        }

        async fn has_permission(
            &self,
            _user: &User,
        ) -> Result<Option<ExternalUserMapping>, AppError> {
            Ok(None)
        }

        async fn get_external_user(
            &self,
            _query: &ExternalUserQuery,
        ) -> Result<Option<ExternalUser>, AppError> {
            Ok(Some(ExternalUser {
                username: "me".into(),
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            }))
        }
    }

    fn storage(root: &Path) -> LocalFileSystemStorage {
        LocalFileSystemStorage::new("local", root.to_path_buf(), Arc::new(CurrentUserAuth))
    }

    fn mapping() -> ExternalUserMapping {
        ExternalUserMapping::new(
            "user-1".into(),
            "test".into(),
            nix::unistd::getuid().as_raw().to_string(),
            "me".into(),
            serde_json::Value::Null,
        )
    }

    #[test]
    fn path_guard_rejects_escapes_and_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path());

        assert!(storage.is_valid_path("alice/ws-1"));
        assert!(storage.is_valid_path("alice/../bob"));
        assert!(!storage.is_valid_path(""));
        assert!(!storage.is_valid_path("."));
        assert!(!storage.is_valid_path("alice/.."));
        assert!(!storage.is_valid_path("../sibling"));
        assert!(!storage.is_valid_path("/etc"));
    }

    #[tokio::test]
    async fn tree_and_size_skip_dot_entries_and_symlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path());

        storage.create_dir("ws").await.expect("create dir");
        storage
            .create_file("ws", "notebook.ipynb", b"12345")
            .await
            .expect("file");
        storage
            .create_file("ws", "data/table.csv", b"abc")
            .await
            .expect("nested file");
        storage
            .create_file("ws", ".job-1/output.log", b"hidden")
            .await
            .expect("hidden file");
        storage
            .create_symlink("ws", "shared", dir.path())
            .await
            .expect("symlink");

        let tree = storage.get_dir_tree("ws").await.expect("tree");
        let names: Vec<_> = tree.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["data/table.csv", "notebook.ipynb"]);
        assert_eq!(tree.symlinks, vec![FileEntry { name: "shared".into() }]);

        assert_eq!(storage.get_dir_size("ws").await.expect("size"), 5 + 3 + 6);
    }

    #[tokio::test]
    async fn file_names_cannot_escape_workspace_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path());

        let err = storage
            .create_file("ws", "../../outside.txt", b"x")
            .await
            .expect_err("escape rejected");
        assert!(matches!(err, AppError::Storage(_)));
    }

    #[tokio::test]
    async fn delete_requires_valid_path_and_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path());
        storage.create_dir("alice/ws").await.expect("create");
        storage
            .set_ownership("alice/ws", &mapping(), true)
            .await
            .expect("chown to self");

        assert!(storage.delete_dir("..", &mapping()).await.is_err());

        storage
            .delete_dir("alice/ws", &mapping())
            .await
            .expect("delete");
        assert!(!dir.path().join("alice/ws").exists());
    }
}
