// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotated per-run temporary directories.
//!
//! Runs live under `<root>/kirk.<username>/`; the oldest run directories
//! are deleted so that at most `max_rotate` of them remain, and a `latest`
//! symlink always points at the newest one.

use crate::errors::TempDirError;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use tracing::debug;

const SYMLINK_NAME: &str = "latest";
const FOLDER_PREFIX: &str = "kirk.";

/// A per-run temporary directory.
///
/// Created without a root, it handles requests without touching the
/// filesystem.
#[derive(Debug)]
pub struct TempDir {
    root: Option<Utf8PathBuf>,
    folder: Option<Utf8PathBuf>,
}

impl TempDir {
    /// Creates a new rotated directory under `root`.
    pub fn new(root: Option<&Utf8Path>, max_rotate: usize) -> Result<Self, TempDirError> {
        let Some(root) = root else {
            return Ok(TempDir {
                root: None,
                folder: None,
            });
        };

        if !root.is_dir() {
            return Err(TempDirError::MissingRoot(root.to_path_buf()));
        }

        let folder = Self::rotate(root, max_rotate)?;

        Ok(TempDir {
            root: Some(root.to_path_buf()),
            folder: Some(folder),
        })
    }

    /// Deletes old run directories, creates a new one and returns it.
    fn rotate(root: &Utf8Path, max_rotate: usize) -> Result<Utf8PathBuf, TempDirError> {
        let base = root.join(format!("{FOLDER_PREFIX}{}", whoami::username()));
        fs::create_dir_all(&base)?;

        let mut entries: Vec<Utf8PathBuf> = base
            .read_dir_utf8()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().to_path_buf())
            .filter(|path| path.file_name() != Some(SYMLINK_NAME))
            .collect();

        entries.sort_by_key(|path| {
            fs::metadata(path)
                .and_then(|meta| meta.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });

        if entries.len() >= max_rotate.max(1) {
            let excess = entries.len() - max_rotate.max(1) + 1;
            for path in entries.drain(..excess) {
                debug!(path = %path, "removing old temporary directory");
                fs::remove_dir_all(&path)?;
            }
        }

        let folder = camino_tempfile::tempdir_in(&base)?.into_path();

        let latest = base.join(SYMLINK_NAME);
        if latest.symlink_metadata().is_ok() {
            fs::remove_file(&latest)?;
        }
        std::os::unix::fs::symlink(&folder, &latest)?;

        debug!(path = %folder, "created temporary directory");

        Ok(folder)
    }

    /// The root folder the rotation happens under, when one was given.
    pub fn root(&self) -> Option<&Utf8Path> {
        self.root.as_deref()
    }

    /// Absolute path of this run's directory, when a root was given.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.folder.as_deref()
    }

    /// Creates a directory inside the run directory.
    pub fn mkdir(&self, relative: &str) -> Result<(), TempDirError> {
        if let Some(folder) = &self.folder {
            fs::create_dir_all(folder.join(relative))?;
        }

        Ok(())
    }

    /// Creates a file inside the run directory.
    pub fn mkfile(&self, relative: &str, content: &[u8]) -> Result<(), TempDirError> {
        if let Some(folder) = &self.folder {
            fs::write(folder.join(relative), content)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rootless_tempdir_is_inert() {
        let tmp = TempDir::new(None, 5).unwrap();
        assert_eq!(tmp.root(), None);
        assert_eq!(tmp.path(), None);
        tmp.mkdir("whatever").unwrap();
        tmp.mkfile("whatever", b"content").unwrap();
    }

    #[test]
    fn missing_root_is_rejected() {
        assert!(matches!(
            TempDir::new(Some(Utf8Path::new("/this_root_doesnt_exist")), 5),
            Err(TempDirError::MissingRoot(_))
        ));
    }

    #[test]
    fn rotation_keeps_bounded_history() {
        let root = camino_tempfile::tempdir().unwrap();

        let mut created = Vec::new();
        for _ in 0..8 {
            let tmp = TempDir::new(Some(root.path()), 4).unwrap();
            created.push(tmp.path().unwrap().to_path_buf());
        }

        let base = root
            .path()
            .join(format!("{FOLDER_PREFIX}{}", whoami::username()));
        let survivors: Vec<_> = base
            .read_dir_utf8()
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() != SYMLINK_NAME)
            .collect();

        assert_eq!(survivors.len(), 4);

        // the latest symlink follows the newest directory
        let latest = base.join(SYMLINK_NAME);
        let target = std::fs::read_link(&latest).unwrap();
        assert_eq!(target, created.last().unwrap().as_std_path());
    }

    #[test]
    fn mkdir_and_mkfile_live_under_the_run_directory() {
        let root = camino_tempfile::tempdir().unwrap();
        let tmp = TempDir::new(Some(root.path()), 5).unwrap();

        tmp.mkdir("runtest").unwrap();
        tmp.mkfile("runtest/suite", b"test01 echo ciao\n").unwrap();

        let content = std::fs::read(tmp.path().unwrap().join("runtest/suite")).unwrap();
        assert_eq!(content, b"test01 echo ciao\n");
    }
}
