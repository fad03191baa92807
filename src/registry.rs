//! Process-local registry of buffer objects by global name.
//!
//! The registry guarantees at most one [`BufferObject`] per global name in
//! this process and counts how many times it has been handed out. Importing
//! a name twice returns the same object; freeing it twice only releases the
//! kernel handle on the second free.

use crate::bo::BufferObject;
use crate::error::{Error, Result};
use crate::kernel::{GemHandle, GlobalName};
use std::collections::HashMap;
use std::sync::Arc;

struct Entry {
    refcount: u32,
    object: Arc<BufferObject>,
}

/// Outcome of [`HandleRegistry::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other references remain; the count after this release.
    Retained(u32),
    /// That was the last reference; the entry is gone and the caller must
    /// finalize the object.
    Last,
}

/// Global name to object table with reference counts.
///
/// Holds no locks of its own; the buffer manager wraps it in a mutex held
/// for the whole of each lifecycle operation.
pub struct HandleRegistry {
    table: Option<HashMap<GlobalName, Entry>>,
}

impl HandleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            table: Some(HashMap::new()),
        }
    }

    fn table(&self) -> Result<&HashMap<GlobalName, Entry>> {
        self.table.as_ref().ok_or(Error::NotInitialized)
    }

    fn table_mut(&mut self) -> Result<&mut HashMap<GlobalName, Entry>> {
        self.table.as_mut().ok_or(Error::NotInitialized)
    }

    /// The object registered under `name`, without touching its count.
    pub fn lookup(&self, name: GlobalName) -> Result<Option<Arc<BufferObject>>> {
        Ok(self.table()?.get(&name).map(|entry| entry.object.clone()))
    }

    /// Register a new object with a count of 1.
    ///
    /// Inserting the same object again is a no-op; inserting a different
    /// object under a taken name is a [`Error::NameCollision`].
    pub fn insert(&mut self, name: GlobalName, object: Arc<BufferObject>) -> Result<()> {
        let table = self.table_mut()?;
        if let Some(entry) = table.get(&name) {
            if Arc::ptr_eq(&entry.object, &object) {
                return Ok(());
            }
            tracing::error!(name = name.get(), "name already bound to another buffer object");
            return Err(Error::NameCollision(name));
        }
        table.insert(
            name,
            Entry {
                refcount: 1,
                object,
            },
        );
        crate::observability::record_live_objects(table.len());
        Ok(())
    }

    /// Look up `name` and take one more reference on a hit.
    pub fn acquire(&mut self, name: GlobalName) -> Result<Option<Arc<BufferObject>>> {
        Ok(self.table_mut()?.get_mut(&name).map(|entry| {
            entry.refcount += 1;
            entry.object.clone()
        }))
    }

    /// Drop one reference to `object`.
    ///
    /// Releasing an object that is not registered is a double free and
    /// reported as [`Error::InvariantViolation`].
    pub fn release(&mut self, object: &BufferObject) -> Result<Release> {
        let name = object.name();
        let table = self.table_mut()?;

        let Some(entry) = table
            .get_mut(&name)
            .filter(|entry| std::ptr::eq(Arc::as_ptr(&entry.object), object))
        else {
            tracing::error!(name = name.get(), gem = %object.handle(), "release of unregistered buffer object");
            return Err(Error::InvariantViolation(format!(
                "double free of buffer object {name}"
            )));
        };

        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(Release::Retained(entry.refcount));
        }

        table.remove(&name);
        crate::observability::record_live_objects(table.len());
        Ok(Release::Last)
    }

    /// Current count for `name` (0 if unregistered).
    pub fn refcount(&self, name: GlobalName) -> Result<u32> {
        Ok(self.table()?.get(&name).map_or(0, |entry| entry.refcount))
    }

    /// Whether some registered object owns `handle`.
    pub fn contains_handle(&self, handle: GemHandle) -> bool {
        self.table
            .as_ref()
            .is_some_and(|table| table.values().any(|entry| entry.object.handle() == handle))
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.table.as_ref().map_or(0, HashMap::len)
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.table.is_none()
    }

    /// Tear down the table, returning every object still registered.
    ///
    /// Every later call fails with [`Error::NotInitialized`].
    pub fn destroy(&mut self) -> Vec<Arc<BufferObject>> {
        match self.table.take() {
            Some(table) => table.into_values().map(|entry| entry.object).collect(),
            None => Vec::new(),
        }
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("len", &self.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
