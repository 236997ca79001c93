pub mod backend;
pub mod cache;
pub mod http;
pub mod memory;
pub mod protocol;

pub use backend::*;
pub use cache::*;
pub use http::*;
pub use memory::*;
pub use protocol::*;
