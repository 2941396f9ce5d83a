//! UI-affinity execution context.
//!
//! All widget mutations, template pushes, and snapshot changes must run on
//! one thread. `MainExecutor` is that seam: production code uses
//! `ThreadExecutor` (a dedicated worker thread fed by a channel), tests use
//! `ManualExecutor` to drain work deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use log::warn;
use tokio::sync::mpsc;

/// Unit of work resequenced onto the UI-affinity thread.
pub type Task = Box<dyn FnOnce() + Send>;

pub trait MainExecutor: Send + Sync {
    fn dispatch(&self, task: Task);
    fn dispatch_after(&self, delay: Duration, task: Task);
}

/// Production executor backed by a dedicated worker thread.
pub struct ThreadExecutor {
    sender: mpsc::UnboundedSender<Task>,
}

impl ThreadExecutor {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        std::thread::Builder::new()
            .name("bridge-main".to_string())
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    task();
                }
            })
            .ok();
        ThreadExecutor { sender }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MainExecutor for ThreadExecutor {
    fn dispatch(&self, task: Task) {
        if self.sender.send(task).is_err() {
            warn!("ThreadExecutor: worker gone, dropping task");
        }
    }

    fn dispatch_after(&self, delay: Duration, task: Task) {
        let sender = self.sender.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if sender.send(task).is_err() {
                warn!("ThreadExecutor: worker gone, dropping delayed task");
            }
        });
    }
}

/// Deterministic executor for tests. Queued work runs only when the test
/// calls `drain()`; delayed work only when it calls `run_delayed()`.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Task>>,
    delayed: Mutex<VecDeque<Task>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued tasks until the queue is empty. Tasks run outside the
    /// queue lock so they may dispatch more work.
    pub fn drain(&self) {
        loop {
            let task = match self.queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(poisoned) => poisoned.into_inner().pop_front(),
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Runs tasks scheduled with `dispatch_after`, then drains the queue.
    pub fn run_delayed(&self) {
        loop {
            let task = match self.delayed.lock() {
                Ok(mut delayed) => delayed.pop_front(),
                Err(poisoned) => poisoned.into_inner().pop_front(),
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        self.drain();
    }

    pub fn pending(&self) -> usize {
        match self.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl MainExecutor for ManualExecutor {
    fn dispatch(&self, task: Task) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(task),
            Err(poisoned) => poisoned.into_inner().push_back(task),
        }
    }

    fn dispatch_after(&self, _delay: Duration, task: Task) {
        match self.delayed.lock() {
            Ok(mut delayed) => delayed.push_back(task),
            Err(poisoned) => poisoned.into_inner().push_back(task),
        }
    }
}
