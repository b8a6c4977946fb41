pub(crate) mod fixtures {
  use bytes::Bytes;
  use chrono::Utc;
  use parking_lot::Mutex;
  use std::collections::{BTreeMap, BTreeSet};
  use std::sync::Arc;

  use crate::codec::JsonCodec;
  use crate::config::{ConfigHandle, SchedulerConfig};
  use crate::cron::{CronJobManager, TokioCronScheduler};
  use crate::driver::{Driver, DriverCall, DriverHandle, Offer, TaskLaunch};
  use crate::events::EventBus;
  use crate::filter::SchedulingFilter;
  use crate::model::{
    Attribute, HostAttributes, Identity, JobConfiguration, JobKey, MaintenanceMode,
    ScheduledTask, TaskConfig, TaskEvent, TaskStatus,
  };
  use crate::query::TaskQuery;
  use crate::state_machine::StateManager;
  use crate::storage::Storage;
  use crate::assigner::TaskAssigner;

  pub fn task_config(role: &str, job: &str, shard_id: u32) -> TaskConfig {
    return TaskConfig {
      owner: Identity {
        role: role.to_string(),
        user: role.to_string(),
      },
      environment: "test".to_string(),
      job_name: job.to_string(),
      shard_id,
      num_cpus: 1.0,
      ram_mb: 1024,
      disk_mb: 1024,
      requested_ports: BTreeSet::new(),
      constraints: BTreeSet::new(),
      is_service: false,
      production: false,
      priority: 0,
      max_task_failures: 1,
      contact_email: Some(format!("{role}@example.com")),
      executor_payload: Bytes::new(),
      task_links: BTreeMap::new(),
    };
  }

  pub fn job_configuration(role: &str, job: &str, shard_count: u32) -> JobConfiguration {
    return JobConfiguration {
      key: JobKey::new(role, "test", job),
      owner: Identity {
        role: role.to_string(),
        user: role.to_string(),
      },
      task: task_config(role, job, 0),
      shard_count,
      cron_schedule: None,
      cron_collision_policy: None,
    };
  }

  /// A stored task with a coherent event history ending in `status`.
  pub fn scheduled_task(
    task_id: &str,
    role: &str,
    job: &str,
    shard_id: u32,
    status: TaskStatus,
  ) -> ScheduledTask {
    let now = Utc::now();
    let mut task = ScheduledTask::new(task_id.to_string(), task_config(role, job, shard_id), now);
    if status != TaskStatus::Init {
      task.events.push(TaskEvent {
        timestamp: now,
        status,
        message: None,
      });
      task.status = status;
    }
    return task;
  }

  pub fn offer(
    offer_id: &str,
    slave_id: &str,
    host: &str,
    num_cpus: f64,
    ram_mb: u64,
    disk_mb: u64,
    ports: &[u16],
  ) -> Offer {
    return Offer {
      offer_id: offer_id.to_string(),
      slave_id: slave_id.to_string(),
      host: host.to_string(),
      num_cpus,
      ram_mb,
      disk_mb,
      ports: ports.iter().copied().collect(),
    };
  }

  pub fn host_attributes(host: &str, attributes: Vec<Attribute>) -> HostAttributes {
    return HostAttributes::new(host, attributes);
  }

  /// Driver that records calls for assertions.
  #[derive(Default)]
  pub struct RecordingDriver {
    calls: Mutex<Vec<DriverCall>>,
  }

  impl RecordingDriver {
    pub fn calls(&self) -> Vec<DriverCall> {
      return self.calls.lock().clone();
    }

    pub async fn wait_for_calls(&self, count: usize) {
      while self.calls.lock().len() < count {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
      }
    }
  }

  impl Driver for RecordingDriver {
    fn kill_task(&self, task_id: &str) {
      self.calls.lock().push(DriverCall::KillTask {
        task_id: task_id.to_string(),
      });
    }

    fn launch_task(&self, offer_id: &str, task: &TaskLaunch) {
      self.calls.lock().push(DriverCall::LaunchTask {
        offer_id: offer_id.to_string(),
        task: Box::new(task.clone()),
      });
    }

    fn cancel_offer(&self, offer_id: &str) {
      self.calls.lock().push(DriverCall::CancelOffer {
        offer_id: offer_id.to_string(),
      });
    }
  }

  /// Storage, state machine and a captive driver queue wired together the
  /// way the assembled scheduler does it, minus the async machinery.
  pub struct StateHarness {
    pub state: StateManager,
    pub bus: EventBus,
    pub config: Arc<ConfigHandle>,
    driver: DriverHandle,
    driver_receiver: async_channel::Receiver<DriverCall>,
  }

  impl StateHarness {
    pub fn new() -> Self {
      let bus = EventBus::new();
      let (driver, driver_receiver) = DriverHandle::new_pair();
      let config = Arc::new(ConfigHandle::new(SchedulerConfig::default()));
      let storage = Storage::new(&config.load(), bus.clone(), driver.clone());
      return StateHarness {
        state: StateManager::new(storage),
        bus,
        config,
        driver,
        driver_receiver,
      };
    }

    /// Assigner sharing the harness driver queue, so launches and cancels
    /// surface via `driver_calls`.
    pub fn assigner(&self) -> TaskAssigner {
      let storage = self.state.storage().clone();
      return TaskAssigner::new(
        self.state.clone(),
        SchedulingFilter::new(storage),
        self.driver.clone(),
        Arc::new(JsonCodec),
        None,
        self.config.clone(),
      );
    }

    pub fn cron_manager(&self) -> Arc<CronJobManager> {
      return CronJobManager::new(
        self.state.clone(),
        Arc::new(TokioCronScheduler::new()),
        self.config.clone(),
      );
    }

    pub fn fetch(&self, task_id: &str) -> Option<ScheduledTask> {
      return self
        .state
        .storage()
        .consistent_read(|state| state.tasks.fetch_tasks(&TaskQuery::by_id(task_id)).pop());
    }

    pub fn all_tasks(&self) -> Vec<ScheduledTask> {
      return self
        .state
        .storage()
        .consistent_read(|state| state.tasks.fetch_tasks(&TaskQuery::new()));
    }

    pub fn pending_tasks(&self) -> Vec<ScheduledTask> {
      return self.state.storage().consistent_read(|state| {
        return state
          .tasks
          .fetch_tasks(&TaskQuery::by_status(TaskStatus::Pending));
      });
    }

    pub fn save_tasks(&self, tasks: Vec<ScheduledTask>) {
      self
        .state
        .storage()
        .write(|state, _work| {
          state.tasks.save_tasks(tasks.clone());
          return Ok(());
        })
        .unwrap();
    }

    pub fn save_host_attributes(&self, attributes: HostAttributes) {
      self
        .state
        .storage()
        .write(|state, _work| {
          state.attributes.save_host_attributes(attributes.clone());
          return Ok(());
        })
        .unwrap();
    }

    pub fn set_maintenance(&self, host: &str, mode: MaintenanceMode) {
      self
        .state
        .storage()
        .write(|state, _work| {
          state.attributes.set_maintenance_mode(host, mode);
          return Ok(());
        })
        .unwrap();
    }

    /// Walks a PENDING task through ASSIGNED/STARTING/RUNNING up to `target`.
    pub fn run_to(&self, task_id: &str, target: TaskStatus) {
      for status in [TaskStatus::Assigned, TaskStatus::Starting, TaskStatus::Running] {
        self
          .state
          .change_state(&TaskQuery::by_id(task_id), status, None)
          .unwrap();
        if status == target {
          break;
        }
      }
    }

    pub fn insert_running_task(&self, role: &str, job: &str, shard_id: u32) -> String {
      let created = self
        .state
        .insert_tasks(vec![task_config(role, job, shard_id)])
        .unwrap();
      let task_id = created[0].task_id().to_string();
      self.run_to(&task_id, TaskStatus::Running);
      return task_id;
    }

    /// Drains and returns everything queued for the driver so far.
    pub fn driver_calls(&self) -> Vec<DriverCall> {
      let mut calls = Vec::new();
      while let Ok(call) = self.driver_receiver.try_recv() {
        calls.push(call);
      }
      return calls;
    }
  }
}
