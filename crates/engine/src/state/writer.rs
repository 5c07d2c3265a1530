//! Single writer for stack state.
//!
//! The executor owns the in-memory [`StackState`] and hands full snapshots to
//! a [`StateWriter`]. One blocking task drains the queue in order and calls the
//! backing [`StateStore`], so writes are never concurrent and a later snapshot
//! always lands after an earlier one.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use super::{StackState, StateStore, StateStoreError};

enum WriteCommand {
    Save(Box<StackState>),
    Remove(String),
    Flush(oneshot::Sender<Result<(), StateStoreError>>),
}

pub struct StateWriter {
    sender: mpsc::UnboundedSender<WriteCommand>,
    task: JoinHandle<Result<(), StateStoreError>>,
}

impl StateWriter {
    /// Start the writer task. Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn StateStore>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WriteCommand>();
        let task = tokio::task::spawn_blocking(move || {
            let mut first_error: Option<StateStoreError> = None;
            while let Some(command) = receiver.blocking_recv() {
                match command {
                    WriteCommand::Save(state) => {
                        if let Err(error) = store.save(&state) {
                            warn!(stack = %state.stack_name, %error, "failed to persist stack state");
                            first_error.get_or_insert(error);
                        }
                    }
                    WriteCommand::Remove(stack_name) => {
                        if let Err(error) = store.remove(&stack_name) {
                            warn!(stack = %stack_name, %error, "failed to remove stack state");
                            first_error.get_or_insert(error);
                        }
                    }
                    WriteCommand::Flush(reply) => {
                        let _ = reply.send(first_error.take().map_or(Ok(()), Err));
                    }
                }
            }
            first_error.map_or(Ok(()), Err)
        });
        Self { sender, task }
    }

    /// Queue a snapshot for persistence.
    pub fn save(&self, state: &StackState) -> Result<(), StateStoreError> {
        self.sender
            .send(WriteCommand::Save(Box::new(state.clone())))
            .map_err(|_| StateStoreError::WriterClosed)
    }

    /// Queue removal of a stack's state.
    pub fn remove(&self, stack_name: &str) -> Result<(), StateStoreError> {
        self.sender
            .send(WriteCommand::Remove(stack_name.to_string()))
            .map_err(|_| StateStoreError::WriterClosed)
    }

    /// Wait until everything queued so far is written; reports the first failure since the last flush.
    pub async fn flush(&self) -> Result<(), StateStoreError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(WriteCommand::Flush(reply))
            .map_err(|_| StateStoreError::WriterClosed)?;
        response.await.map_err(|_| StateStoreError::WriterClosed)?
    }

    /// Drain the queue and stop the writer.
    pub async fn close(self) -> Result<(), StateStoreError> {
        drop(self.sender);
        self.task.await.map_err(|_| StateStoreError::WriterClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateStore;

    struct FailingStore;

    impl StateStore for FailingStore {
        fn load(&self, _stack_name: &str) -> Result<Option<StackState>, StateStoreError> {
            Ok(None)
        }

        fn save(&self, _state: &StackState) -> Result<(), StateStoreError> {
            Err(StateStoreError::Io(std::io::Error::other("disk full")))
        }

        fn remove(&self, _stack_name: &str) -> Result<(), StateStoreError> {
            Ok(())
        }

        fn list_stacks(&self) -> Result<Vec<String>, StateStoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn later_snapshots_win() {
        let store = Arc::new(InMemoryStateStore::new());
        let writer = StateWriter::spawn(store.clone());
        for generation in 1..=5 {
            let mut state = StackState::new("web");
            state.generation = generation;
            writer.save(&state).unwrap();
        }
        writer.flush().await.unwrap();
        assert_eq!(store.load("web").unwrap().unwrap().generation, 5);
        assert_eq!(store.save_count(), 5);

        writer.remove("web").unwrap();
        writer.close().await.unwrap();
        assert!(store.load("web").unwrap().is_none());
    }

    #[tokio::test]
    async fn write_failures_surface_on_flush() {
        let writer = StateWriter::spawn(Arc::new(FailingStore));
        writer.save(&StackState::new("web")).unwrap();
        let error = writer.flush().await.unwrap_err();
        assert!(matches!(error, StateStoreError::Io(_)));
        writer.flush().await.unwrap();
        writer.close().await.unwrap();
    }
}
