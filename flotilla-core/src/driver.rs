use bytes::Bytes;
use log::*;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::model::{Attribute, Resources, TaskStatus};

/// A snapshot of unreserved resources on one worker host, as delivered by the
/// cluster manager.
#[derive(Clone, Debug, PartialEq)]
pub struct Offer {
  pub offer_id: String,
  pub slave_id: String,
  pub host: String,
  pub num_cpus: f64,
  pub ram_mb: u64,
  pub disk_mb: u64,
  /// Free ports, flattened from the ranges on the wire.
  pub ports: BTreeSet<u16>,
}

impl Offer {
  pub fn resources(&self) -> Resources {
    return Resources {
      num_cpus: self.num_cpus,
      ram_mb: self.ram_mb,
      disk_mb: self.disk_mb,
      num_ports: self.ports.len() as u32,
    };
  }
}

/// Task status as reported by the cluster manager. `Unknown` covers reports
/// for ids the driver no longer recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverStatus {
  Starting,
  Running,
  Finished,
  Failed,
  Killed,
  Lost,
  Unknown,
}

impl DriverStatus {
  pub fn as_task_status(self) -> Option<TaskStatus> {
    return match self {
      DriverStatus::Starting => Some(TaskStatus::Starting),
      DriverStatus::Running => Some(TaskStatus::Running),
      DriverStatus::Finished => Some(TaskStatus::Finished),
      DriverStatus::Failed => Some(TaskStatus::Failed),
      DriverStatus::Killed => Some(TaskStatus::Killed),
      DriverStatus::Lost => Some(TaskStatus::Lost),
      DriverStatus::Unknown => None,
    };
  }
}

/// Everything the worker needs to launch one task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskLaunch {
  pub task_id: String,
  pub slave_id: String,
  pub resources: Resources,
  pub ports: BTreeMap<String, u16>,
  /// Encoded task description, produced by the configured codec.
  pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DriverCall {
  KillTask { task_id: String },
  LaunchTask { offer_id: String, task: Box<TaskLaunch> },
  CancelOffer { offer_id: String },
}

/// Outbound interface to the cluster manager. Implementations are expected to
/// be cheap to call; the dispatcher invokes them off the storage lock.
pub trait Driver: Send + Sync {
  fn kill_task(&self, task_id: &str);
  fn launch_task(&self, offer_id: &str, task: &TaskLaunch);
  fn cancel_offer(&self, offer_id: &str);
}

/// Loads the attribute set a host advertises, consulted when offers arrive.
pub trait AttributeLoader: Send + Sync {
  fn load(&self, host: &str) -> Vec<Attribute>;
}

/// Cloneable sending side of the driver call queue. Calls are enqueued by the
/// committing thread and drained by the dispatcher task, so no driver code
/// ever runs under a storage lock.
#[derive(Clone)]
pub struct DriverHandle {
  sender: async_channel::Sender<DriverCall>,
}

impl DriverHandle {
  pub fn new_pair() -> (DriverHandle, async_channel::Receiver<DriverCall>) {
    let (sender, receiver) = async_channel::unbounded();
    return (DriverHandle { sender }, receiver);
  }

  pub fn send(&self, call: DriverCall) {
    // The channel is unbounded; try_send only fails once the dispatcher is
    // gone, which happens during shutdown.
    if let Err(err) = self.sender.try_send(call) {
      warn!("Dropping driver call during shutdown: {err}");
    }
  }
}

/// Forwards queued calls to the driver until the sending side closes.
pub fn spawn_driver_dispatcher(
  receiver: async_channel::Receiver<DriverCall>,
  driver: Arc<dyn Driver>,
) -> tokio::task::AbortHandle {
  let handle = tokio::spawn(async move {
    while let Ok(call) = receiver.recv().await {
      match call {
        DriverCall::KillTask { task_id } => driver.kill_task(&task_id),
        DriverCall::LaunchTask { offer_id, task } => driver.launch_task(&offer_id, &task),
        DriverCall::CancelOffer { offer_id } => driver.cancel_offer(&offer_id),
      };
    }
    info!("Driver dispatcher exited");
  });
  return handle.abort_handle();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::fixtures::RecordingDriver;

  #[tokio::test]
  async fn test_dispatcher_forwards_in_order() {
    let (handle, receiver) = DriverHandle::new_pair();
    let driver = Arc::new(RecordingDriver::default());
    let _dispatcher = spawn_driver_dispatcher(receiver, driver.clone());

    handle.send(DriverCall::KillTask {
      task_id: "a".to_string(),
    });
    handle.send(DriverCall::CancelOffer {
      offer_id: "o1".to_string(),
    });

    driver.wait_for_calls(2).await;
    assert_eq!(
      driver.calls(),
      vec![
        DriverCall::KillTask {
          task_id: "a".to_string()
        },
        DriverCall::CancelOffer {
          offer_id: "o1".to_string()
        },
      ]
    );
  }
}
