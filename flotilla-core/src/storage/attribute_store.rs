use indexmap::IndexMap;

use crate::model::{HostAttributes, MaintenanceMode};

/// Last observed attribute set per host, refreshed as offers arrive.
#[derive(Clone, Default)]
pub struct AttributeStore {
  hosts: IndexMap<String, HostAttributes>,
}

impl AttributeStore {
  pub fn save_host_attributes(&mut self, attributes: HostAttributes) {
    self.hosts.insert(attributes.host.clone(), attributes);
  }

  pub fn fetch_host_attributes(&self, host: &str) -> Option<HostAttributes> {
    return self.hosts.get(host).cloned();
  }

  pub fn set_maintenance_mode(&mut self, host: &str, mode: MaintenanceMode) -> bool {
    let Some(attributes) = self.hosts.get_mut(host) else {
      return false;
    };
    attributes.mode = mode;
    return true;
  }

  pub fn all(&self) -> Vec<HostAttributes> {
    return self.hosts.values().cloned().collect();
  }
}
