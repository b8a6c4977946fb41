use log::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::filter::Veto;
use crate::model::{ScheduledTask, TaskStatus};

/// Events published by the scheduling core after the originating storage
/// write has committed.
#[derive(Clone, Debug)]
pub enum SchedulerEvent {
  StorageStarted,
  TaskStateChange {
    task: ScheduledTask,
    old_status: Option<TaskStatus>,
  },
  TasksDeleted {
    task_ids: BTreeSet<String>,
  },
  Vetoed {
    task_id: String,
    vetoes: Vec<Veto>,
  },
}

type Listener = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

struct BusInner {
  listeners: RwLock<Vec<Listener>>,
  queue: Mutex<VecDeque<SchedulerEvent>>,
  draining: AtomicBool,
}

/// Best-effort fan-out bus. Publication enqueues; whichever thread holds the
/// drain flag delivers queued events in order, so a listener publishing (or
/// writing to storage, which publishes on commit) re-enters safely instead of
/// recursing or deadlocking.
#[derive(Clone)]
pub struct EventBus {
  inner: Arc<BusInner>,
}

impl Default for EventBus {
  fn default() -> Self {
    return EventBus::new();
  }
}

impl EventBus {
  pub fn new() -> Self {
    return EventBus {
      inner: Arc::new(BusInner {
        listeners: RwLock::new(Vec::new()),
        queue: Mutex::new(VecDeque::new()),
        draining: AtomicBool::new(false),
      }),
    };
  }

  pub fn subscribe<F>(&self, listener: F)
  where
    F: 'static + Send + Sync + Fn(&SchedulerEvent),
  {
    self.inner.listeners.write().push(Arc::new(listener));
  }

  pub fn publish(&self, event: SchedulerEvent) {
    self.inner.queue.lock().push_back(event);
    self.drain();
  }

  pub fn publish_all(&self, events: impl IntoIterator<Item = SchedulerEvent>) {
    let mut queued = 0;
    {
      let mut queue = self.inner.queue.lock();
      for event in events {
        queue.push_back(event);
        queued += 1;
      }
    }
    if queued > 0 {
      self.drain();
    }
  }

  fn drain(&self) {
    loop {
      if self.inner.draining.swap(true, Ordering::SeqCst) {
        // Another frame is already delivering; it will pick up our events.
        return;
      }

      loop {
        let Some(event) = self.inner.queue.lock().pop_front() else {
          break;
        };

        // Snapshot the listener list so callbacks can subscribe without
        // deadlocking against the delivery loop.
        let listeners: Vec<Listener> = self.inner.listeners.read().clone();
        for listener in &listeners {
          listener(&event);
        }
      }

      self.inner.draining.store(false, Ordering::SeqCst);

      // Re-check: an event enqueued between the pop returning empty and the
      // flag clearing would otherwise sit until the next publish.
      if self.inner.queue.lock().is_empty() {
        return;
      }
    }
  }
}

impl std::fmt::Debug for EventBus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return f
      .debug_struct("EventBus")
      .field("listeners", &self.inner.listeners.read().len())
      .finish();
  }
}

pub(crate) fn log_event(event: &SchedulerEvent) {
  match event {
    SchedulerEvent::StorageStarted => info!("Storage started"),
    SchedulerEvent::TaskStateChange { task, old_status } => debug!(
      "Task {} transitioned {:?} -> {}",
      task.task_id(),
      old_status,
      task.status
    ),
    SchedulerEvent::TasksDeleted { task_ids } => debug!("Tasks deleted: {task_ids:?}"),
    SchedulerEvent::Vetoed { task_id, vetoes } => {
      debug!("Placement vetoed for {task_id}: {vetoes:?}")
    }
  };
}
