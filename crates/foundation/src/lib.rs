pub mod bounds;
pub mod containment;
pub mod geohash;
pub mod precision;
pub mod tile;

// Foundation crate: small, well-tested geographic primitives only.
pub use bounds::*;
pub use containment::*;
pub use precision::*;
pub use tile::*;
