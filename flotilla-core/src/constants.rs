use chrono::Duration;

/// Pattern every role, environment, job name and user must match.
pub const GOOD_IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9._-]{0,254}$";

/// Attribute name reserving a host for a single role.
pub const DEDICATED_ATTRIBUTE: &str = "dedicated";

pub const HOST_CONSTRAINT: &str = "host";
pub const RACK_CONSTRAINT: &str = "rack";

/// Job-store namespace for cron-managed jobs.
pub const CRON_MANAGER_KEY: &str = "CRON";
/// Job-store namespace for directly submitted jobs.
pub const IMMEDIATE_MANAGER_KEY: &str = "IMMEDIATE";

pub const MAX_TASKS_PER_JOB_DEFAULT: u32 = 1000;

pub const SLOW_QUERY_THRESHOLD_DEFAULT: Duration = Duration::milliseconds(25);

pub const PREEMPTION_CANDIDACY_DELAY_DEFAULT: Duration = Duration::minutes(10);
pub const PREEMPTION_INTERVAL_DEFAULT: Duration = Duration::seconds(5);

pub const CRON_START_INITIAL_BACKOFF_DEFAULT: Duration = Duration::seconds(1);
pub const CRON_START_MAX_BACKOFF_DEFAULT: Duration = Duration::minutes(1);

/// Resources set aside on every offer for the executor process itself.
pub const EXECUTOR_CPU_RESERVATION: f64 = 0.25;
pub const EXECUTOR_RAM_RESERVATION_MB: u64 = 128;

/// Score at and above which a veto cannot be overcome by preemption.
pub const MAX_VETO_SCORE: u32 = 1000;

pub(crate) const UPDATE_TOKEN_LENGTH: usize = 24;
