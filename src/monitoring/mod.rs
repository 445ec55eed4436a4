//! Run Monitoring Module
//!
//! # Components
//!
//! - [`ResourceMonitor`]: CPU and memory usage of the engine and its units
//! - [`ExecutionTimeline`]: Per-instance timing rebuilt from the transition log

pub mod resource;
pub mod timeline;

pub use resource::{ResourceMonitor, ResourceSample};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
