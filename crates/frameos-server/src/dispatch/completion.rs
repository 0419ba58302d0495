//! Single-assignment completion for one command.

use std::sync::Mutex;

use frameos_core::{CommandReply, FrameError, FrameResult};
use tokio::sync::oneshot;
use uuid::Uuid;

pub type CommandOutcome = FrameResult<CommandReply>;

/// Resolving side. The first `resolve` wins; later ones get `AlreadyResolved`.
#[derive(Debug)]
pub struct CompletionSlot {
    tx: Mutex<Option<oneshot::Sender<CommandOutcome>>>,
}

/// Awaiting side, handed to the caller of `enqueue`.
#[derive(Debug)]
pub struct CompletionHandle {
    id: Uuid,
    rx: oneshot::Receiver<CommandOutcome>,
}

pub fn completion(id: Uuid) -> (CompletionSlot, CompletionHandle) {
    let (tx, rx) = oneshot::channel();
    (
        CompletionSlot {
            tx: Mutex::new(Some(tx)),
        },
        CompletionHandle { id, rx },
    )
}

impl CompletionSlot {
    pub fn resolve(&self, outcome: CommandOutcome) -> FrameResult<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(FrameError::AlreadyResolved)?;
        // The caller may have stopped waiting; that is not an error here.
        let _ = tx.send(outcome);
        Ok(())
    }
}

impl CompletionHandle {
    pub async fn wait(self) -> CommandOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(FrameError::Other(format!("command {} was abandoned", self.id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let (slot, handle) = completion(Uuid::new_v4());
        slot.resolve(Ok(CommandReply::json(json!({"exit": 0})))).unwrap();
        assert!(matches!(
            slot.resolve(Err(FrameError::Other("late".into()))),
            Err(FrameError::AlreadyResolved)
        ));
        assert_eq!(handle.wait().await.unwrap().exit_code(), Some(0));
    }

    #[tokio::test]
    async fn dropped_slot_reports_abandoned() {
        let (slot, handle) = completion(Uuid::new_v4());
        drop(slot);
        assert!(matches!(handle.wait().await, Err(FrameError::Other(_))));
    }
}
