use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::{JobKey, TaskConfig};

/// Per-shard before/after pair inside a registered update. A missing `old`
/// means the shard is being added; a missing `new` means it is being removed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardUpdateConfiguration {
  pub shard_id: u32,
  pub old: Option<TaskConfig>,
  pub new: Option<TaskConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfiguration {
  pub job_key: JobKey,
  pub token: String,
  pub shards: Vec<ShardUpdateConfiguration>,
}

impl UpdateConfiguration {
  pub fn shard(&self, shard_id: u32) -> Option<&ShardUpdateConfiguration> {
    return self.shards.iter().find(|s| s.shard_id == shard_id);
  }
}

#[derive(Clone, Default)]
pub struct UpdateStore {
  updates: IndexMap<JobKey, UpdateConfiguration>,
}

impl UpdateStore {
  pub fn save_update(&mut self, update: UpdateConfiguration) {
    self.updates.insert(update.job_key.clone(), update);
  }

  pub fn fetch_update(&self, key: &JobKey) -> Option<UpdateConfiguration> {
    return self.updates.get(key).cloned();
  }

  pub fn remove_update(&mut self, key: &JobKey) -> Option<UpdateConfiguration> {
    return self.updates.shift_remove(key);
  }
}
