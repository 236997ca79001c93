//! Viewport-adaptive geospatial aggregation engine.
//!
//! Decides, per viewport event, whether a map visual renders clustered cell
//! summaries or exact features, and fetches only the tiles the view does not
//! already hold.

pub mod config;
pub mod driver;
pub mod error;
pub mod merge;
pub mod probe;
pub mod render;
pub mod state;
pub mod strategy;
pub mod viewport;

pub use config::*;
pub use driver::*;
pub use error::*;
pub use render::*;
pub use state::*;
pub use strategy::*;
pub use viewport::*;
