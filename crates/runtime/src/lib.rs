pub mod filter_bus;
pub mod generation;
pub mod metrics;

pub use filter_bus::*;
pub use generation::*;
pub use metrics::*;
