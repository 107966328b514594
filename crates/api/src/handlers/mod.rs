pub mod executions;
pub mod metrics;
pub mod workflows;

use crate::AppState;
