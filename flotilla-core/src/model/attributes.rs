use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
  pub name: String,
  pub values: BTreeSet<String>,
}

impl Attribute {
  pub fn new(name: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
    return Attribute {
      name: name.into(),
      values: values.into_iter().collect(),
    };
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceMode {
  #[default]
  None,
  Scheduled,
  Draining,
  Drained,
}

impl MaintenanceMode {
  /// Hosts in these modes accept no new work.
  pub fn blocks_placement(self) -> bool {
    return matches!(self, MaintenanceMode::Draining | MaintenanceMode::Drained);
  }
}

impl std::fmt::Display for MaintenanceMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      MaintenanceMode::None => "none",
      MaintenanceMode::Scheduled => "scheduled",
      MaintenanceMode::Draining => "draining",
      MaintenanceMode::Drained => "drained",
    };
    return write!(f, "{name}");
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAttributes {
  pub host: String,
  pub attributes: Vec<Attribute>,
  pub mode: MaintenanceMode,
}

impl HostAttributes {
  pub fn new(host: impl Into<String>, attributes: Vec<Attribute>) -> Self {
    return HostAttributes {
      host: host.into(),
      attributes,
      mode: MaintenanceMode::None,
    };
  }

  /// Union of values across all attributes carrying `name`.
  pub fn values_of(&self, name: &str) -> Option<BTreeSet<String>> {
    let mut values = BTreeSet::new();
    let mut found = false;
    for attribute in &self.attributes {
      if attribute.name == name {
        found = true;
        values.extend(attribute.values.iter().cloned());
      }
    }
    if !found {
      return None;
    }
    return Some(values);
  }
}
