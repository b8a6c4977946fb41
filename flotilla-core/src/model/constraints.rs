use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single placement constraint attached to a task, keyed by host attribute name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Constraint {
  pub name: String,
  pub kind: ConstraintKind,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConstraintKind {
  /// Host attribute must (or, negated, must not) carry one of these values.
  Value {
    negated: bool,
    values: BTreeSet<String>,
  },
  /// At most `limit` active tasks of the same job per distinct attribute value.
  Limit { limit: u32 },
}

impl Constraint {
  pub fn value(name: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
    return Constraint {
      name: name.into(),
      kind: ConstraintKind::Value {
        negated: false,
        values: values.into_iter().collect(),
      },
    };
  }

  pub fn limit(name: impl Into<String>, limit: u32) -> Self {
    return Constraint {
      name: name.into(),
      kind: ConstraintKind::Limit { limit },
    };
  }
}
