//! Output directory creation.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to create directory `{local_path}`")]
pub struct DirCreateError {
    pub local_path: String,
    #[source]
    pub source: io::Error,
}

/// Keeps track of directories known to exist under the root, and creates
/// missing ones (with their parents) before output files are written. The
/// root path itself is assumed to exist.
pub struct DirectoryCache {
    root_path: String,
    existing_local_paths: HashSet<String>,
}

impl DirectoryCache {
    pub fn new(root_path: &str) -> DirectoryCache {
        DirectoryCache { root_path: root_path.to_string(), existing_local_paths: HashSet::new() }
    }

    /// Ensure the directory at `local_path` exists. Idempotent; directories
    /// created by concurrent processes are tolerated.
    pub fn create(&mut self, local_path: &str) -> Result<(), DirCreateError> {
        if local_path == "." {
            return Ok(());
        }
        if self.existing_local_paths.contains(local_path) {
            return Ok(());
        }
        let local_dir_path = crate::path::dirname(local_path);
        self.create(&local_dir_path)?;
        let full_path = format!("{}/{}", self.root_path, local_path);
        match fs::DirBuilder::new().mode(0o700).create(&full_path) {
            Ok(()) => {}
            Err(ref error) if error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(error) => {
                return Err(DirCreateError { local_path: local_path.to_string(), source: error })
            }
        }
        self.existing_local_paths.insert(local_path.to_string());
        Ok(())
    }
}
