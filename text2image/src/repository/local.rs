use std::path::{Path, PathBuf};

use snafu::{ensure, Snafu};

use super::repo::Repo;
use crate::error::BoxedError;

/// `LocalRepo` errors.
#[derive(Debug, Snafu)]
pub enum LocalRepoError {
    #[snafu(display("Repository is not a directory: {}", path.to_string_lossy()))]
    NotADirectory { path: PathBuf },
}

/// Repository in a directory on the local machine.
#[derive(Clone, Debug)]
pub struct LocalRepo {
    path: PathBuf,
}

impl LocalRepo {
    /// Create a new local repository.
    ///
    /// * `path` - The directory of the repository.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, LocalRepoError> {
        let path = path.as_ref().to_path_buf();
        ensure!(path.is_dir(), NotADirectorySnafu { path });
        Ok(Self { path })
    }

    /// Directory of the repository.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Repo for LocalRepo {
    fn file(&self, path: impl AsRef<Path>) -> Result<Option<PathBuf>, BoxedError> {
        let path = self.path.join(path);
        Ok(path.is_file().then_some(path))
    }

    fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.path.join(path).is_file()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use snafu::{report, FromString, ResultExt, Whatever};

    use super::{LocalRepo, LocalRepoError};
    use crate::repository::repo::Repo;

    #[test]
    #[report]
    fn local_repo_finds_files() -> Result<(), Whatever> {
        let dir = tempfile::tempdir().whatever_context("Cannot create temporary directory")?;
        fs::write(dir.path().join("config.json"), "{}").whatever_context("Cannot write file")?;

        let repo = LocalRepo::new(dir.path()).whatever_context("Cannot open repository")?;
        assert!(repo.exists("config.json"));
        assert!(!repo.exists("model.safetensors"));
        assert_eq!(
            repo.file("config.json")
                .map_err(|e| Whatever::with_source(e, "Cannot get file".to_string()))?,
            Some(dir.path().join("config.json"))
        );
        assert_eq!(
            repo.file("model.safetensors")
                .map_err(|e| Whatever::with_source(e, "Cannot get file".to_string()))?,
            None
        );

        Ok(())
    }

    #[test]
    fn local_repo_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            LocalRepo::new(dir.path().join("missing")),
            Err(LocalRepoError::NotADirectory { .. })
        ));
    }
}
