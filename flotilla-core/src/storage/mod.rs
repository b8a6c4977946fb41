pub mod attribute_store;
pub mod job_store;
pub mod quota_store;
pub mod task_store;
pub mod update_store;

pub use attribute_store::AttributeStore;
pub use job_store::JobStore;
pub use quota_store::QuotaStore;
pub use task_store::TaskStore;
pub use update_store::{ShardUpdateConfiguration, UpdateConfiguration, UpdateStore};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

use crate::config::SchedulerConfig;
use crate::driver::{DriverCall, DriverHandle};
use crate::events::{EventBus, SchedulerEvent};

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("Storage transaction failed: {0}")]
  Transaction(String),
}

/// All authoritative scheduler state. Cloned wholesale by writers and swapped
/// in atomically on commit, so a failed mutation leaves nothing behind.
#[derive(Clone, Default)]
pub struct StoreState {
  pub tasks: TaskStore,
  pub jobs: JobStore,
  pub updates: UpdateStore,
  pub quotas: QuotaStore,
  pub attributes: AttributeStore,
}

impl StoreState {
  pub fn new(config: &SchedulerConfig) -> Self {
    return StoreState {
      tasks: TaskStore::new(config.slow_query_log_threshold()),
      ..Default::default()
    };
  }
}

/// Side effects accumulated during a storage write. Nothing in here runs
/// until the write has committed and the write lock is released.
#[derive(Default)]
pub struct WorkQueue {
  events: Vec<SchedulerEvent>,
  driver_calls: Vec<DriverCall>,
}

impl WorkQueue {
  pub fn push_event(&mut self, event: SchedulerEvent) {
    self.events.push(event);
  }

  pub fn push_driver_call(&mut self, call: DriverCall) {
    self.driver_calls.push(call);
  }
}

struct StorageInner {
  committed: ArcSwap<StoreState>,
  write_lock: Mutex<()>,
  bus: EventBus,
  driver: DriverHandle,
}

/// Snapshot-consistent façade over the in-memory stores.
///
/// Reads load the committed snapshot without blocking writers. Writes
/// serialize on a single lock, mutate a private clone and publish it
/// atomically; their queued side effects run strictly after the lock drops.
#[derive(Clone)]
pub struct Storage {
  inner: Arc<StorageInner>,
}

impl Storage {
  pub fn new(config: &SchedulerConfig, bus: EventBus, driver: DriverHandle) -> Self {
    return Storage {
      inner: Arc::new(StorageInner {
        committed: ArcSwap::from_pointee(StoreState::new(config)),
        write_lock: Mutex::new(()),
        bus,
        driver,
      }),
    };
  }

  pub fn bus(&self) -> &EventBus {
    return &self.inner.bus;
  }

  /// Runs `work` against a snapshot that is linearizable with respect to
  /// writes: it either wholly precedes or wholly follows any concurrent
  /// commit.
  pub fn consistent_read<T>(&self, work: impl FnOnce(&StoreState) -> T) -> T {
    let snapshot = self.inner.committed.load_full();
    return work(&snapshot);
  }

  /// Read permitted to miss the latest commit. Hot paths (offer matching,
  /// the preempter scan) go through here so the cost model stays explicit
  /// even though the current implementation shares the snapshot load.
  pub fn weakly_consistent_read<T>(&self, work: impl FnOnce(&StoreState) -> T) -> T {
    let snapshot = self.inner.committed.load();
    return work(&snapshot);
  }

  /// Applies `mutation` serialized against all other writes. On error the
  /// mutation has no visible effect and no queued side effect runs.
  pub fn write<T>(
    &self,
    mutation: impl FnOnce(&mut StoreState, &mut WorkQueue) -> Result<T, StorageError>,
  ) -> Result<T, StorageError> {
    let mut work = WorkQueue::default();

    let result = {
      let _guard = self.inner.write_lock.lock();
      let mut state = (**self.inner.committed.load()).clone();
      let result = mutation(&mut state, &mut work)?;
      self.inner.committed.store(Arc::new(state));
      result
      // Lock drops here; side effects below run outside it.
    };

    for call in work.driver_calls.drain(..) {
      self.inner.driver.send(call);
    }
    self.inner.bus.publish_all(work.events.drain(..));

    return Ok(result);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::TaskStatus;
  use crate::query::TaskQuery;
  use crate::test::fixtures;

  fn storage() -> Storage {
    let (driver, _receiver) = DriverHandle::new_pair();
    return Storage::new(&SchedulerConfig::default(), EventBus::new(), driver);
  }

  #[test]
  fn test_failed_write_has_no_effect() {
    let storage = storage();

    let result: Result<(), _> = storage.write(|state, _work| {
      state.tasks.save_tasks(vec![fixtures::scheduled_task(
        "task-0",
        "jim",
        "my_job",
        0,
        TaskStatus::Pending,
      )]);
      return Err(StorageError::Transaction("boom".to_string()));
    });

    assert!(result.is_err());
    let count = storage.consistent_read(|state| state.tasks.fetch_tasks(&TaskQuery::new()).len());
    assert_eq!(count, 0);
  }

  #[test]
  fn test_deep_copy_on_read() {
    let storage = storage();
    storage
      .write(|state, _work| {
        state.tasks.save_tasks(vec![fixtures::scheduled_task(
          "task-0",
          "jim",
          "my_job",
          0,
          TaskStatus::Pending,
        )]);
        return Ok(());
      })
      .unwrap();

    // Mutating the returned copy must not leak back into storage.
    let mut fetched =
      storage.consistent_read(|state| state.tasks.fetch_tasks(&TaskQuery::by_id("task-0")));
    fetched[0].status = TaskStatus::Lost;
    fetched[0].assigned.slave_host = Some("nope".to_string());

    let stored =
      storage.consistent_read(|state| state.tasks.fetch_tasks(&TaskQuery::by_id("task-0")));
    assert_eq!(stored[0].status, TaskStatus::Pending);
    assert_eq!(stored[0].assigned.slave_host, None);
  }

  #[test]
  fn test_events_delivered_after_commit() {
    let storage = storage();
    let bus = storage.bus().clone();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let storage_clone = storage.clone();
    bus.subscribe(move |event| {
      if let SchedulerEvent::StorageStarted = event {
        // By delivery time the write is visible to fresh reads.
        let count = storage_clone
          .consistent_read(|state| state.tasks.fetch_tasks(&TaskQuery::new()).len());
        seen_clone.lock().push(count);
      }
    });

    storage
      .write(|state, work| {
        state.tasks.save_tasks(vec![fixtures::scheduled_task(
          "task-0",
          "jim",
          "my_job",
          0,
          TaskStatus::Pending,
        )]);
        work.push_event(SchedulerEvent::StorageStarted);
        return Ok(());
      })
      .unwrap();

    assert_eq!(*seen.lock(), vec![1]);
  }
}
