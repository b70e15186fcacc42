pub mod assets;
pub mod catalog;
pub mod config;
pub mod error;
pub mod kv;
pub mod merge;
pub mod model;
pub mod policy;
pub mod prelude;
pub mod queue;
pub mod scanner;
pub mod staleness;
pub mod tracker;
pub mod watcher;

pub use config::*;
pub use error::*;
pub use model::*;
pub use policy::*;
