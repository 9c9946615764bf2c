//! Attribute store access
//!
//! sysfs-style pseudo-file attributes: small text values read and written
//! whole. The trait keeps the driver independent of the tree that backs it,
//! so tests run against [`crate::testing::MemStore`] while production uses
//! [`SysfsStore`] rooted at `/sys`.
//!
//! Paths handed to a store are always relative to its root, e.g.
//! `bus/platform/devices/vhci_hcd.0/nports`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

pub trait AttrStore {
    /// Read a text attribute, trimmed of surrounding whitespace.
    fn read_attr(&self, path: &str) -> io::Result<String>;

    /// Write a command string to a control attribute.
    fn write_attr(&self, path: &str, value: &str) -> io::Result<()>;

    /// Entry names directly under `path`.
    fn list_dir(&self, path: &str) -> io::Result<Vec<String>>;
}

impl<T: AttrStore + ?Sized> AttrStore for &T {
    fn read_attr(&self, path: &str) -> io::Result<String> {
        (**self).read_attr(path)
    }

    fn write_attr(&self, path: &str, value: &str) -> io::Result<()> {
        (**self).write_attr(path, value)
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        (**self).list_dir(path)
    }
}

impl<T: AttrStore + ?Sized> AttrStore for std::sync::Arc<T> {
    fn read_attr(&self, path: &str) -> io::Result<String> {
        (**self).read_attr(path)
    }

    fn write_attr(&self, path: &str, value: &str) -> io::Result<()> {
        (**self).write_attr(path, value)
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        (**self).list_dir(path)
    }
}

/// Attribute store over a real filesystem subtree.
pub struct SysfsStore {
    root: PathBuf,
}

impl SysfsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AttrStore for SysfsStore {
    fn read_attr(&self, path: &str) -> io::Result<String> {
        let content = fs::read_to_string(self.root.join(path))?;
        Ok(content.trim().to_owned())
    }

    fn write_attr(&self, path: &str, value: &str) -> io::Result<()> {
        // Control attributes must be opened write-only and never truncated.
        let mut file = OpenOptions::new().write(true).open(self.root.join(path))?;
        file.write_all(value.as_bytes())
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysfs_store_reads_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bus/platform/devices/vhci_hcd.0")).unwrap();
        fs::write(
            dir.path().join("bus/platform/devices/vhci_hcd.0/nports"),
            "8\n",
        )
        .unwrap();

        let store = SysfsStore::new(dir.path());
        assert_eq!(
            store
                .read_attr("bus/platform/devices/vhci_hcd.0/nports")
                .unwrap(),
            "8"
        );
    }

    #[test]
    fn sysfs_store_lists_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bus/platform/devices/vhci_hcd.0")).unwrap();
        fs::create_dir_all(dir.path().join("bus/platform/devices/vhci_hcd.1")).unwrap();

        let store = SysfsStore::new(dir.path());
        let mut names = store.list_dir("bus/platform/devices").unwrap();
        names.sort();
        assert_eq!(names, vec!["vhci_hcd.0", "vhci_hcd.1"]);
    }

    #[test]
    fn sysfs_store_write_requires_existing_attr() {
        let dir = tempfile::tempdir().unwrap();
        let store = SysfsStore::new(dir.path());
        assert!(store.write_attr("missing/attach", "0 3 65538 3").is_err());
    }
}
