//! Private copies of "special" executables.
//!
//! A special executable is run from a private copy instead of the original file, so that its
//! copy can be told apart from other users of the same file by inode. Each original file is
//! copied at most once, keyed by its inode number. The cache is only modified while holding the
//! supervisor-wide [`SyscallLocks::SPECIAL_FILES`] lock.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::host::syscall::locks::{GlobalLocks, SyscallLocks};

/// The default directory for the copies, relative to the supervisor's working directory.
pub const SPECIAL_DIR: &str = "./special/";

#[derive(Debug)]
pub struct SpecialFiles {
    dir: PathBuf,
    global_locks: Arc<GlobalLocks>,
    // inode of the original file -> its copy
    copies: Mutex<HashMap<u64, PathBuf>>,
}

impl SpecialFiles {
    /// Create the directory for the copies, if it doesn't exist.
    pub fn new(dir: impl Into<PathBuf>, global_locks: Arc<GlobalLocks>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            global_locks,
            copies: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the copy of `full_path`, copying it first if this is the first time
    /// the file (or another link to the same inode) is seen.
    pub fn create_special_file(&self, full_path: &Path) -> std::io::Result<PathBuf> {
        let inode = std::fs::metadata(full_path)?.ino();

        // held while copying so that two callers can't copy the same file
        let _guard = self.global_locks.acquire(SyscallLocks::SPECIAL_FILES);
        let mut copies = self.copies.lock().unwrap();
        if let Some(copy) = copies.get(&inode) {
            return Ok(copy.clone());
        }

        let name = full_path
            .file_name()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_else(|| "special".to_string());
        let copy = self.dir.join(format!("{inode}_{name}"));

        // also copies the permission bits
        std::fs::copy(full_path, &copy)?;
        log::debug!(
            "Created special file {} for {}",
            copy.display(),
            full_path.display()
        );

        copies.insert(inode, copy.clone());
        Ok(copy)
    }

    /// Returns `true` if a copy of the file with this inode was created.
    pub fn contains(&self, inode: u64) -> bool {
        self.copies.lock().unwrap().contains_key(&inode)
    }

    pub fn len(&self) -> usize {
        self.copies.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn locks() -> Arc<GlobalLocks> {
        Arc::new(GlobalLocks::new())
    }

    #[test]
    fn test_copy_once_per_inode() {
        let src_dir = tempfile::tempdir().unwrap();
        let special_dir = tempfile::tempdir().unwrap();

        let original = src_dir.path().join("prog");
        std::fs::write(&original, b"#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&original, std::fs::Permissions::from_mode(0o755)).unwrap();
        let link = src_dir.path().join("prog-link");
        std::fs::hard_link(&original, &link).unwrap();

        let special = SpecialFiles::new(special_dir.path().join("special"), locks()).unwrap();
        assert!(special.dir().is_dir());
        assert!(special.is_empty());

        let copy = special.create_special_file(&original).unwrap();
        assert!(copy.starts_with(special.dir()));
        assert_eq!(std::fs::read(&copy).unwrap(), std::fs::read(&original).unwrap());
        assert_eq!(
            std::fs::metadata(&copy).unwrap().permissions().mode() & 0o777,
            0o755
        );

        // the hard link shares the inode, so it shares the copy
        assert_eq!(special.create_special_file(&link).unwrap(), copy);
        assert_eq!(special.len(), 1);
        assert!(special.contains(std::fs::metadata(&original).unwrap().ino()));
    }

    #[test]
    fn test_missing_file() {
        let special_dir = tempfile::tempdir().unwrap();
        let special = SpecialFiles::new(special_dir.path(), locks()).unwrap();
        assert!(special
            .create_special_file(Path::new("/nonexistent/prog"))
            .is_err());
        assert!(special.is_empty());
    }

    #[test]
    fn test_waits_for_global_lock() {
        let special_dir = tempfile::tempdir().unwrap();
        let global_locks = locks();
        let special =
            Arc::new(SpecialFiles::new(special_dir.path(), Arc::clone(&global_locks)).unwrap());

        // a monitor emulating a syscall that needs the lock
        let guard = global_locks.acquire(SyscallLocks::SPECIAL_FILES);

        let handle = {
            let special = Arc::clone(&special);
            std::thread::spawn(move || special.create_special_file(Path::new("/bin/true")))
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished());
        assert!(special.is_empty());

        drop(guard);
        let copy = handle.join().unwrap().unwrap();
        assert!(copy.starts_with(special_dir.path()));
        assert_eq!(special.len(), 1);
    }
}
