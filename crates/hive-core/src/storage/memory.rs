use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use thiserror_no_std::Error;

use super::{LogStore, WriteMode};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStoreError {
    #[error("storage is unavailable")]
    Unavailable,
}

#[derive(Default)]
struct Contents {
    files: BTreeMap<String, Vec<u8>>,
    failing: bool,
}

/// In-memory [`LogStore`] for the simulator and tests.
///
/// Clones share their files, so a clone handed to a new log instance behaves
/// like a card that survived a reboot. [`MemoryStore::set_failing`] makes
/// every operation fail until cleared.
#[derive(Clone)]
pub struct MemoryStore {
    contents: Arc<Mutex<CriticalSectionRawMutex, RefCell<Contents>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            contents: Arc::new(Mutex::new(RefCell::new(Contents::default()))),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.contents.lock(|c| c.borrow_mut().failing = failing);
    }

    /// Place a file directly, e.g. a log left behind by an earlier boot.
    pub fn insert(&self, name: &str, data: &[u8]) {
        self.contents.lock(|c| {
            c.borrow_mut().files.insert(String::from(name), data.to_vec());
        });
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.contents.lock(|c| c.borrow().files.get(name).cloned())
    }

    pub fn file_names(&self) -> Vec<String> {
        self.contents
            .lock(|c| c.borrow().files.keys().cloned().collect())
    }

    fn check(&self) -> Result<(), MemoryStoreError> {
        if self.contents.lock(|c| c.borrow().failing) {
            return Err(MemoryStoreError::Unavailable);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryStore {
    type Error = MemoryStoreError;

    fn list_files(&mut self, visit: &mut dyn FnMut(&str)) -> Result<(), Self::Error> {
        self.check()?;
        for name in self.file_names() {
            visit(&name);
        }
        Ok(())
    }

    fn read_file(
        &mut self,
        name: &str,
        visit: &mut dyn FnMut(&[u8]),
    ) -> Result<bool, Self::Error> {
        self.check()?;
        match self.file(name) {
            Some(data) => {
                // Small chunks, like a sector-wise read
                for chunk in data.chunks(64) {
                    visit(chunk);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_file(&mut self, name: &str, mode: WriteMode, data: &[u8]) -> Result<(), Self::Error> {
        self.check()?;
        self.contents.lock(|c| {
            let mut contents = c.borrow_mut();
            let file = contents.files.entry(String::from(name)).or_default();
            if mode == WriteMode::Truncate {
                file.clear();
            }
            file.extend_from_slice(data);
        });
        Ok(())
    }
}
