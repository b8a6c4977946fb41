pub mod attributes;
pub mod constraints;
pub mod job;
pub mod resources;
pub mod task;

pub use attributes::{Attribute, HostAttributes, MaintenanceMode};
pub use constraints::{Constraint, ConstraintKind};
pub use job::{CronCollisionPolicy, Identity, JobConfiguration, JobKey};
pub use resources::{Quota, Resources};
pub use task::{AssignedTask, ScheduledTask, TaskConfig, TaskEvent, TaskStatus};
