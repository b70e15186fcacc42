pub mod bootstrap;
pub mod service;

pub use service::{ServiceEvent, ServiceStatus, TrackerControl, TrackerService};
