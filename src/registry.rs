use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

/// Bytes of entropy behind every handle (128 bits, 32 hex chars).
const ID_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to draw entropy for a new handle: {0}")]
    Entropy(#[from] getrandom::Error),
}

/// Keyed store of exclusively-owned resources behind opaque hex handles.
///
/// The map lock is held only for the map operation itself. Values are
/// usually `Arc`s so that lookups can hand out a shared reference without
/// keeping the lock.
pub struct HandleRegistry<T> {
    entries: Mutex<HashMap<String, T>>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, value: T) -> Result<String, RegistryError> {
        self.insert_with(value, generate_id)
    }

    fn insert_with<F>(&self, value: T, mut next_id: F) -> Result<String, RegistryError>
    where
        F: FnMut() -> Result<String, RegistryError>,
    {
        let mut entries = self.entries.lock();
        loop {
            let id = next_id()?;
            if entries.contains_key(&id) {
                tracing::warn!(id = %id, "handle collision, regenerating");
                continue;
            }
            entries.insert(id.clone(), value);
            return Ok(id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.entries.lock().remove(id)
    }

    /// Removes every entry matching `pred` in one critical section.
    pub fn remove_where<P>(&self, mut pred: P) -> Vec<(String, T)>
    where
        P: FnMut(&T) -> bool,
    {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, value)| pred(value))
            .map(|(id, _)| id.clone())
            .collect();

        doomed
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|value| (id, value)))
            .collect()
    }

    pub fn drain(&self) -> Vec<(String, T)> {
        self.entries.lock().drain().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone> HandleRegistry<T> {
    pub fn get(&self, id: &str) -> Option<T> {
        self.entries.lock().get(id).cloned()
    }

    /// Snapshot of the ids whose value matches `pred`.
    pub fn ids_where<P>(&self, mut pred: P) -> Vec<String>
    where
        P: FnMut(&T) -> bool,
    {
        let mut ids: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, value)| pred(value))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn generate_id() -> Result<String, RegistryError> {
    let mut bytes = [0u8; ID_BYTES];
    getrandom::getrandom(&mut bytes)?;
    Ok(format!("{:032x}", u128::from_be_bytes(bytes)))
}
