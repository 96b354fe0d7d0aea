//! Follow-up commands scheduled by a running command.
//!
//! The execution loop owns a [`WorkQueue`]. Each command receives a
//! [`QueueHandle`] and may push follow-ups onto it; they are appended to the
//! queue only after the command's whole lifecycle finished, and the loop stops
//! at the first failing item, dropping whatever is still queued.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Handle a running command uses to schedule follow-ups.
pub struct QueueHandle<T> {
    pending: Mutex<Vec<T>>,
}

impl<T> Default for QueueHandle<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl<T> QueueHandle<T> {
    /// Create an empty handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `item` to run after the current command
    pub fn push(&self, item: T) {
        self.pending.lock().push(item);
    }

    fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// FIFO of commands owned by the execution loop.
pub struct WorkQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T: std::fmt::Debug> WorkQueue<T> {
    /// Create a queue holding `first`
    pub fn starting_with(first: T) -> Self {
        let mut queue = Self::default();
        queue.items.push_back(first);
        queue
    }

    /// Items still waiting
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run items in FIFO order until the queue is empty or one fails.
    ///
    /// Items pushed through the handle during `run` are enqueued after `run`
    /// returns successfully; a failing item discards its own pushes too.
    pub fn drain<E, F>(&mut self, mut run: F) -> Result<(), E>
    where
        F: FnMut(T, &QueueHandle<T>) -> Result<(), E>,
    {
        while let Some(item) = self.items.pop_front() {
            debug!(item = ?item, "Running queued command");
            let handle = QueueHandle::new();
            if let Err(e) = run(item, &handle) {
                if !self.items.is_empty() {
                    warn!(dropped = self.items.len(), "Dropping queued commands after failure");
                }
                self.items.clear();
                return Err(e);
            }
            self.items.extend(handle.take());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_ups_run_after_the_current_item() {
        let mut queue = WorkQueue::starting_with("down");
        let mut order = Vec::new();

        let result: Result<(), String> = queue.drain(|item, handle| {
            order.push(format!("start {}", item));
            if item == "down" {
                handle.push("backup");
            }
            order.push(format!("end {}", item));
            Ok(())
        });

        assert!(result.is_ok());
        assert_eq!(
            order,
            vec!["start down", "end down", "start backup", "end backup"]
        );
    }

    #[test]
    fn follow_ups_keep_fifo_order() {
        let mut queue = WorkQueue::starting_with(0);
        let mut seen = Vec::new();

        let result: Result<(), String> = queue.drain(|item, handle| {
            seen.push(item);
            if item == 0 {
                handle.push(1);
                handle.push(2);
            }
            if item == 1 {
                handle.push(3);
            }
            Ok(())
        });

        assert!(result.is_ok());
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn first_failure_stops_the_queue() {
        let mut queue = WorkQueue::starting_with(0);
        let mut seen = Vec::new();

        let result = queue.drain(|item, handle| {
            seen.push(item);
            match item {
                0 => {
                    handle.push(1);
                    handle.push(2);
                    Ok(())
                }
                1 => {
                    handle.push(9);
                    Err(format!("item {} failed", item))
                }
                _ => Ok(()),
            }
        });

        assert_eq!(result, Err("item 1 failed".to_string()));
        assert_eq!(seen, vec![0, 1]);
        assert!(queue.is_empty());
    }
}
