//! In-process memo tables shared by every resolution stage
//!
//! Each entry moves from absent to pending to settled exactly once and is
//! never invalidated. Concurrent requesters of a pending key wait on the
//! same cell, so each key is produced by exactly one call of its producer.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};

type Cell<V> = Arc<OnceLock<std::result::Result<V, Arc<Error>>>>;

/// A settle-once memo table keyed by `K`.
#[derive(Debug)]
pub struct Memo<K, V> {
    cells: Mutex<HashMap<K, Cell<V>>>,
}

impl<K, V> Memo<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a new empty memo table
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Get the settled value for `key`, running `producer` if nobody has.
    ///
    /// The table lock is released before `producer` runs, so producers may
    /// recursively consult this same table for other keys.
    pub fn get_or_settle<F>(&self, key: K, producer: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let cell = {
            let mut cells = self.cells.lock().map_err(|_| Error::LockPoisoned {
                context: "memo table".to_string(),
            })?;
            Arc::clone(cells.entry(key).or_default())
        };
        match cell.get_or_init(|| producer().map_err(Arc::new)) {
            Ok(value) => Ok(value.clone()),
            Err(error) => Err(Error::Shared(Arc::clone(error))),
        }
    }

    /// Get a settled value without producing one.
    ///
    /// Returns `None` when the key is absent or still pending.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let cells = self.cells.lock().map_err(|_| Error::LockPoisoned {
            context: "memo table".to_string(),
        })?;
        Ok(cells
            .get(key)
            .and_then(|cell| cell.get())
            .and_then(|settled| settled.as_ref().ok().cloned()))
    }

    /// Check if a key has been requested
    pub fn contains(&self, key: &K) -> Result<bool> {
        let cells = self.cells.lock().map_err(|_| Error::LockPoisoned {
            context: "memo table".to_string(),
        })?;
        Ok(cells.contains_key(key))
    }

    /// Snapshot of every successfully settled entry.
    pub fn settled(&self) -> Result<Vec<(K, V)>> {
        let cells = self.cells.lock().map_err(|_| Error::LockPoisoned {
            context: "memo table".to_string(),
        })?;
        Ok(cells
            .iter()
            .filter_map(|(key, cell)| match cell.get() {
                Some(Ok(value)) => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect())
    }

    /// Get the number of requested entries
    pub fn len(&self) -> Result<usize> {
        let cells = self.cells.lock().map_err(|_| Error::LockPoisoned {
            context: "memo table".to_string(),
        })?;
        Ok(cells.len())
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<K, V> Default for Memo<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
