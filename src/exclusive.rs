//! Exclusive-tag run queues.
//!
//! A pipeline holding a tag has an entry in the map; pipelines that asked to
//! queue behind it park a wake-up sender in the entry's FIFO. Releasing the
//! tag hands it directly to the oldest live waiter, or removes the entry
//! when nobody is waiting.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Outcome of asking to queue on a tag.
#[derive(Debug)]
pub enum Turn {
    /// The tag was free and now belongs to the caller.
    Acquired,
    /// The tag is held; awaiting the receiver yields ownership.
    Queued(oneshot::Receiver<()>),
}

#[derive(Debug, Default)]
pub struct RunQueues {
    queues: Mutex<HashMap<String, VecDeque<oneshot::Sender<()>>>>,
}

impl RunQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `tag` if nobody holds it.
    pub fn try_acquire(&self, tag: &str) -> bool {
        let Ok(mut queues) = self.queues.lock() else {
            return false;
        };
        if queues.contains_key(tag) {
            return false;
        }
        queues.insert(tag.to_string(), VecDeque::new());
        true
    }

    /// Queue behind the current holder of `tag`, or take it when it was
    /// released in the meantime.
    pub fn enqueue(&self, tag: &str) -> Turn {
        let (tx, rx) = oneshot::channel();
        let Ok(mut queues) = self.queues.lock() else {
            return Turn::Acquired;
        };
        match queues.get_mut(tag) {
            Some(queue) => {
                queue.push_back(tx);
                Turn::Queued(rx)
            }
            None => {
                queues.insert(tag.to_string(), VecDeque::new());
                Turn::Acquired
            }
        }
    }

    /// Hand `tag` to the next waiter, or free it.
    pub fn release(&self, tag: &str) {
        let Ok(mut queues) = self.queues.lock() else {
            return;
        };
        let Some(queue) = queues.get_mut(tag) else {
            return;
        };
        // Waiters whose pipeline went away have dropped their receiver.
        while let Some(waiter) = queue.pop_front() {
            if waiter.send(()).is_ok() {
                tracing::debug!(tag, waiting = queue.len(), "exclusive tag handed to queued pipeline");
                return;
            }
        }
        queues.remove(tag);
    }

    pub fn is_held(&self, tag: &str) -> bool {
        self.queues
            .lock()
            .map(|queues| queues.contains_key(tag))
            .unwrap_or(false)
    }

    pub fn waiting(&self, tag: &str) -> usize {
        self.queues
            .lock()
            .ok()
            .and_then(|queues| queues.get(tag).map(VecDeque::len))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_claim_is_refused_until_release() {
        let queues = RunQueues::new();
        assert!(queues.try_acquire("build:proj"));
        assert!(!queues.try_acquire("build:proj"));
        queues.release("build:proj");
        assert!(!queues.is_held("build:proj"));
        assert!(queues.try_acquire("build:proj"));
    }

    #[tokio::test]
    async fn waiters_are_woken_in_fifo_order() {
        let queues = Arc::new(RunQueues::new());
        assert!(queues.try_acquire("deploy"));

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for id in 0..3 {
            let Turn::Queued(turn) = queues.enqueue("deploy") else {
                panic!("tag should be held");
            };
            let queues = queues.clone();
            let order_tx = order_tx.clone();
            handles.push(tokio::spawn(async move {
                turn.await.expect("woken");
                order_tx.send(id).expect("record order");
                queues.release("deploy");
            }));
        }
        assert_eq!(queues.waiting("deploy"), 3);

        queues.release("deploy");
        for handle in handles {
            handle.await.expect("join");
        }
        let mut order = Vec::new();
        while let Ok(id) = order_rx.try_recv() {
            order.push(id);
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert!(!queues.is_held("deploy"));
    }

    #[test]
    fn abandoned_waiters_are_skipped() {
        let queues = RunQueues::new();
        assert!(queues.try_acquire("t"));
        let abandoned = queues.enqueue("t");
        drop(abandoned);
        let Turn::Queued(mut live) = queues.enqueue("t") else {
            panic!("tag should be held");
        };
        queues.release("t");
        assert!(live.try_recv().is_ok());
        assert!(queues.is_held("t"));
    }

    #[test]
    fn enqueue_on_free_tag_acquires() {
        let queues = RunQueues::new();
        assert!(matches!(queues.enqueue("free"), Turn::Acquired));
        assert!(queues.is_held("free"));
    }
}
