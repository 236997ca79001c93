//! Backend abstraction.
//!
//! Methods return boxed futures so the trait stays dyn-compatible and the
//! engine can hold an `Arc<dyn SearchBackend>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::protocol::{AggregateRequest, AggregateResponse, SearchRequest, SearchResponse};

/// Type alias for a boxed future that can be sent between threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend transport failed: {0}")]
    Transport(String),
    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid backend response: {0}")]
    Decode(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// The two backend operations the engine consumes.
///
/// Implementations must be `Send + Sync`; calls for different tiles are in
/// flight concurrently.
pub trait SearchBackend: Send + Sync {
    fn aggregate(
        &self,
        req: AggregateRequest,
    ) -> BoxFuture<'_, Result<AggregateResponse, BackendError>>;

    fn search(&self, req: SearchRequest) -> BoxFuture<'_, Result<SearchResponse, BackendError>>;
}

impl<T: SearchBackend + ?Sized> SearchBackend for Arc<T> {
    fn aggregate(
        &self,
        req: AggregateRequest,
    ) -> BoxFuture<'_, Result<AggregateResponse, BackendError>> {
        (**self).aggregate(req)
    }

    fn search(&self, req: SearchRequest) -> BoxFuture<'_, Result<SearchResponse, BackendError>> {
        (**self).search(req)
    }
}
