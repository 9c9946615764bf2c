//! In-memory attribute store for tests
//!
//! Plays the role Go's `fstest.MapFS` style fixtures play elsewhere: a
//! `HashMap` of attribute paths that also records control writes, so tests
//! in this crate and in the agent can drive the driver without a kernel.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use crate::attr::AttrStore;

type WriteHook = Box<dyn Fn(&str, &str) -> Vec<(String, String)> + Send + Sync>;

/// HashMap-backed attribute store.
#[derive(Default)]
pub struct MemStore {
    files: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
    on_write: Mutex<Option<WriteHook>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace an attribute.
    pub fn insert(&self, path: impl Into<String>, content: impl Into<String>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), content.into());
    }

    /// Drop an attribute, simulating e.g. a device disappearing mid-read.
    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    /// Every control write issued so far, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }

    /// Install a hook invoked on every control write. The returned pairs
    /// are applied to the store, letting a test simulate the kernel
    /// reacting to an attach/detach command by rewriting status attributes.
    pub fn set_write_hook(
        &self,
        hook: impl Fn(&str, &str) -> Vec<(String, String)> + Send + Sync + 'static,
    ) {
        *self.on_write.lock().unwrap() = Some(Box::new(hook));
    }
}

impl AttrStore for MemStore {
    fn read_attr(&self, path: &str) -> io::Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|content| content.trim().to_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no attribute {path}")))
    }

    fn write_attr(&self, path: &str, value: &str) -> io::Result<()> {
        if !self.files.lock().unwrap().contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no attribute {path}"),
            ));
        }
        self.writes
            .lock()
            .unwrap()
            .push((path.to_owned(), value.to_owned()));

        let updates = self
            .on_write
            .lock()
            .unwrap()
            .as_ref()
            .map(|hook| hook(path, value))
            .unwrap_or_default();
        for (update_path, content) in updates {
            self.insert(update_path, content);
        }
        Ok(())
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let prefix = format!("{path}/");
        let mut names: Vec<String> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_owned)
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no directory {path}"),
            ));
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_writes_to_existing_attrs() {
        let store = MemStore::new();
        store.insert("ctrl/attach", "");
        store.write_attr("ctrl/attach", "0 7 65538 3").unwrap();
        assert_eq!(
            store.writes(),
            vec![("ctrl/attach".to_owned(), "0 7 65538 3".to_owned())]
        );
        assert!(store.write_attr("ctrl/missing", "x").is_err());
    }

    #[test]
    fn lists_unique_child_names() {
        let store = MemStore::new();
        store.insert("bus/platform/devices/vhci_hcd.0/nports", "8");
        store.insert("bus/platform/devices/vhci_hcd.0/status", "...");
        store.insert("bus/platform/devices/vhci_hcd.1/status", "...");
        let names = store.list_dir("bus/platform/devices").unwrap();
        assert_eq!(names, vec!["vhci_hcd.0", "vhci_hcd.1"]);
    }

    #[test]
    fn write_hook_mutates_store() {
        let store = MemStore::new();
        store.insert("ctrl/detach", "");
        store.insert("ctrl/status", "before");
        store.set_write_hook(|path, _| {
            if path == "ctrl/detach" {
                vec![("ctrl/status".to_owned(), "after".to_owned())]
            } else {
                Vec::new()
            }
        });
        store.write_attr("ctrl/detach", "0").unwrap();
        assert_eq!(store.read_attr("ctrl/status").unwrap(), "after");
    }
}
