pub mod config;
pub mod dates;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod normalize;
pub mod pipeline;
pub mod process;
pub mod schema;
pub mod sink;

pub use error::{PipelineError, RowError};
