pub mod config;
pub mod curve;
pub mod error;
pub mod events;
pub mod runs;
pub mod schedule;

pub use config::{AppendMode, GridOptions, LoopConfig, SharedOptions};
pub use curve::DenoiseCurve;
pub use error::LoopbackError;
pub use schedule::{PromptSchedule, ScheduleSource};
