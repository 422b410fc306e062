//! Queue bridges — typed FIFO channels between pipeline components.
//!
//! A queue bridge has exactly one consuming component; the sender side is
//! cloneable so several producers can feed the same stage.  Per-component
//! FIFO ordering is the channel's ordering.

use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::task::Task;

/// Sender half of a task queue bridge.
#[derive(Clone)]
pub struct TaskQueueSender {
    name: &'static str,
    tx: mpsc::Sender<Vec<Task>>,
}

impl TaskQueueSender {
    /// Push a batch of tasks to the consuming component.
    pub async fn push(&self, tasks: Vec<Task>) -> Result<(), AgentError> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.tx
            .send(tasks)
            .await
            .map_err(|_| AgentError::Transport(format!("queue '{}' closed", self.name)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A typed FIFO bridge carrying task batches.
///
/// Constructed by the bridge catalog before any component starts; the
/// receiver is taken exactly once by the consuming component.
pub struct TaskQueue {
    name: &'static str,
    tx: mpsc::Sender<Vec<Task>>,
    rx: Option<mpsc::Receiver<Vec<Task>>>,
}

impl TaskQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { name, tx, rx: Some(rx) }
    }

    pub fn sender(&self) -> TaskQueueSender {
        TaskQueueSender { name: self.name, tx: self.tx.clone() }
    }

    /// Take the consumer end.  Panics if taken twice — two consumers on one
    /// queue is a wiring bug that must be caught before the agent runs.
    pub fn take_receiver(&mut self) -> mpsc::Receiver<Vec<Task>> {
        match self.rx.take() {
            Some(rx) => rx,
            None => panic!("queue '{}' receiver taken twice", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDescription;

    fn task(uid: &str) -> Task {
        Task::new(uid, "pilot.0000", TaskDescription::default())
    }

    #[tokio::test]
    async fn push_preserves_fifo_order() {
        let mut q = TaskQueue::new("sched", 8);
        let tx = q.sender();
        let mut rx = q.take_receiver();

        tx.push(vec![task("a")]).await.unwrap();
        tx.push(vec![task("b"), task("c")]).await.unwrap();

        assert_eq!(rx.recv().await.unwrap()[0].uid, "a");
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].uid, "b");
        assert_eq!(batch[1].uid, "c");
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let mut q = TaskQueue::new("sched", 1);
        let tx = q.sender();
        let mut rx = q.take_receiver();

        tx.push(vec![]).await.unwrap();
        tx.push(vec![task("a")]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap()[0].uid, "a");
    }

    #[tokio::test]
    async fn push_after_consumer_drop_is_transport_error() {
        let mut q = TaskQueue::new("sched", 1);
        let tx = q.sender();
        drop(q.take_receiver());

        let err = tx.push(vec![task("a")]).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }

    #[test]
    #[should_panic(expected = "receiver taken twice")]
    fn double_take_panics() {
        let mut q = TaskQueue::new("sched", 1);
        let _ = q.take_receiver();
        let _ = q.take_receiver();
    }
}
