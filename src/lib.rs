pub mod config;
pub mod executor;
pub mod fetch;
pub mod harvest;
pub mod model;
pub mod normalize;
pub mod sink;
pub mod traits;

// Re-export common types for convenience
pub use config::{ConfigError, HarvestConfig};
pub use executor::*;
pub use model::*;
pub use traits::*;
