use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;

use super::{StackState, StateStore, StateStoreError};

/// In-memory state store primarily used for unit testing.
#[derive(Default)]
pub struct InMemoryStateStore {
    stacks: Mutex<IndexMap<String, StackState>>,
    saves: AtomicUsize,
}

impl InMemoryStateStore {
    /// Create an empty in-memory state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls served so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateStore for InMemoryStateStore {
    fn load(&self, stack_name: &str) -> Result<Option<StackState>, StateStoreError> {
        let stacks = self.stacks.lock().expect("state lock poisoned");
        Ok(stacks.get(stack_name).cloned())
    }

    fn save(&self, state: &StackState) -> Result<(), StateStoreError> {
        let mut stacks = self.stacks.lock().expect("state lock poisoned");
        stacks.insert(state.stack_name.clone(), state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, stack_name: &str) -> Result<(), StateStoreError> {
        let mut stacks = self.stacks.lock().expect("state lock poisoned");
        stacks.shift_remove(stack_name);
        Ok(())
    }

    fn list_stacks(&self) -> Result<Vec<String>, StateStoreError> {
        let stacks = self.stacks.lock().expect("state lock poisoned");
        let mut names: Vec<String> = stacks.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
