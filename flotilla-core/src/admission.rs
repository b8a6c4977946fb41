use lazy_static::lazy_static;
use thiserror::Error;

use crate::config::SchedulerConfig;
use crate::constants::{
  DEDICATED_ATTRIBUTE, GOOD_IDENTIFIER_PATTERN, HOST_CONSTRAINT, RACK_CONSTRAINT,
};
use crate::model::{Constraint, ConstraintKind, JobConfiguration, Resources};
use crate::query::TaskQuery;
use crate::storage::StoreState;

lazy_static! {
  static ref IDENTIFIER_REGEX: regex::Regex =
    regex::Regex::new(GOOD_IDENTIFIER_PATTERN).expect("infallible");
  static ref EMAIL_REGEX: regex::Regex =
    regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("infallible");
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
  #[error("Invalid identifier for {field}: '{value}'")]
  InvalidIdentifier { field: &'static str, value: String },
  #[error("{0} must be positive")]
  NonPositiveResource(&'static str),
  #[error("Priority must not be negative")]
  NegativePriority,
  #[error("max_task_failures must be at least 1")]
  InvalidMaxFailures,
  #[error("shard_count {requested} outside 1..={max}")]
  InvalidShardCount { requested: u32, max: u32 },
  #[error("A service job may not carry a cron schedule")]
  ServiceWithCron,
  #[error("Missing or invalid contact email")]
  InvalidContactEmail,
  #[error("Invalid dedicated constraint: {0}")]
  InvalidDedicatedConstraint(String),
  #[error("Quota exceeded for role {0}")]
  QuotaExceeded(String),
}

pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
  if IDENTIFIER_REGEX.is_match(value) {
    return Ok(());
  }
  return Err(ValidationError::InvalidIdentifier {
    field,
    value: value.to_string(),
  });
}

/// Admission gate: validates a submitted job and normalizes its template.
/// The template's job coordinates are overwritten from the job key, and the
/// built-in host (and, for production services, rack) limits are injected
/// when absent.
pub fn validate_and_populate(
  job: &mut JobConfiguration,
  config: &SchedulerConfig,
) -> Result<(), ValidationError> {
  validate_identifier("role", &job.key.role)?;
  validate_identifier("environment", &job.key.environment)?;
  validate_identifier("name", &job.key.name)?;
  validate_identifier("user", &job.owner.user)?;

  if job.shard_count < 1 || job.shard_count > config.max_tasks_per_job {
    return Err(ValidationError::InvalidShardCount {
      requested: job.shard_count,
      max: config.max_tasks_per_job,
    });
  }

  job.owner.role = job.key.role.clone();
  let task = &mut job.task;
  task.owner = job.owner.clone();
  task.environment = job.key.environment.clone();
  task.job_name = job.key.name.clone();

  if task.num_cpus <= 0.0 {
    return Err(ValidationError::NonPositiveResource("num_cpus"));
  }
  if task.ram_mb == 0 {
    return Err(ValidationError::NonPositiveResource("ram_mb"));
  }
  if task.disk_mb == 0 {
    return Err(ValidationError::NonPositiveResource("disk_mb"));
  }
  if task.priority < 0 {
    return Err(ValidationError::NegativePriority);
  }
  if task.max_task_failures < 1 {
    return Err(ValidationError::InvalidMaxFailures);
  }
  if task.is_service && job.cron_schedule.is_some() {
    return Err(ValidationError::ServiceWithCron);
  }
  if config.require_contact_email {
    let valid = task
      .contact_email
      .as_ref()
      .map(|email| EMAIL_REGEX.is_match(email))
      .unwrap_or(false);
    if !valid {
      return Err(ValidationError::InvalidContactEmail);
    }
  }

  let dedicated = validate_dedicated_constraint(job)?;

  let task = &mut job.task;
  let has_constraint =
    |task: &crate::model::TaskConfig, name: &str| task.constraints.iter().any(|c| c.name == name);

  // One shard per host unless the job says otherwise.
  if !has_constraint(task, HOST_CONSTRAINT) {
    task.constraints.insert(Constraint::limit(HOST_CONSTRAINT, 1));
  }
  // Production services additionally spread across racks.
  if task.production && task.is_service && !dedicated && !has_constraint(task, RACK_CONSTRAINT) {
    task.constraints.insert(Constraint::limit(RACK_CONSTRAINT, 1));
  }

  return Ok(());
}

/// A dedicated constraint must be value-typed, non-negated, single-valued,
/// and claim the submitting role as its prefix. Returns whether the job is
/// dedicated.
fn validate_dedicated_constraint(job: &JobConfiguration) -> Result<bool, ValidationError> {
  let Some(constraint) = job
    .task
    .constraints
    .iter()
    .find(|c| c.name == DEDICATED_ATTRIBUTE)
  else {
    return Ok(false);
  };

  let ConstraintKind::Value { negated, ref values } = constraint.kind else {
    return Err(ValidationError::InvalidDedicatedConstraint(
      "must be a value constraint".to_string(),
    ));
  };
  if negated {
    return Err(ValidationError::InvalidDedicatedConstraint(
      "must not be negated".to_string(),
    ));
  }
  if values.len() != 1 {
    return Err(ValidationError::InvalidDedicatedConstraint(
      "must carry exactly one value".to_string(),
    ));
  }

  let value = values.first().expect("len checked above");
  let expected_prefix = format!("{}/", job.owner.role);
  if !value.starts_with(&expected_prefix) {
    return Err(ValidationError::InvalidDedicatedConstraint(format!(
      "value '{value}' is not prefixed by role '{}'",
      job.owner.role
    )));
  }
  return Ok(true);
}

/// Production jobs must fit under their role's quota, counting the
/// production tasks already active. Non-production jobs bypass quota.
pub fn check_quota(state: &StoreState, job: &JobConfiguration) -> Result<(), ValidationError> {
  if !job.task.production {
    return Ok(());
  }
  let role = &job.owner.role;

  let Some(quota) = state.quotas.fetch_quota(role) else {
    return Err(ValidationError::QuotaExceeded(role.clone()));
  };

  let used = state
    .tasks
    .fetch_tasks(&TaskQuery::by_role(role.clone()).active())
    .iter()
    .filter(|task| task.config().production)
    .fold(Resources::default(), |acc, task| {
      return acc.plus(&Resources::from_task(task.config()));
    });

  let per_shard = Resources::from_task(&job.task);
  let requested = (0..job.shard_count).fold(Resources::default(), |acc, _| acc.plus(&per_shard));

  if !quota.accommodates(&used, &requested) {
    return Err(ValidationError::QuotaExceeded(role.clone()));
  }
  return Ok(());
}
