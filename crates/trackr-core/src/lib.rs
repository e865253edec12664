pub mod alert;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod io;
pub mod paths;
pub mod pool;
pub mod queue;
pub mod recent;
pub mod recovery;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod task;

pub use engine::Engine;
pub use error::{Result, TrackrError};
