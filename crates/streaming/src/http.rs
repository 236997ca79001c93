//! JSON-over-HTTP backend.
//!
//! `POST {base}/aggregate` with an [`AggregateRequest`] body and
//! `POST {base}/search` with a [`SearchRequest`] body; both answer JSON.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::backend::{BackendError, BoxFuture, SearchBackend};
use crate::protocol::{AggregateRequest, AggregateResponse, SearchRequest, SearchResponse};

#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/{op}", self.base_url)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        op: &str,
        body: &B,
    ) -> Result<R, BackendError> {
        let url = self.endpoint(op);
        debug!(%url, "backend request");

        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        resp.json::<R>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}

impl SearchBackend for HttpBackend {
    fn aggregate(
        &self,
        req: AggregateRequest,
    ) -> BoxFuture<'_, Result<AggregateResponse, BackendError>> {
        Box::pin(async move { self.post("aggregate", &req).await })
    }

    fn search(&self, req: SearchRequest) -> BoxFuture<'_, Result<SearchResponse, BackendError>> {
        Box::pin(async move { self.post("search", &req).await })
    }
}

#[cfg(test)]
mod tests {
    use super::HttpBackend;

    #[test]
    fn endpoints_ignore_trailing_slash() {
        let b = HttpBackend::new("http://localhost:9200/geo/");
        assert_eq!(b.base_url(), "http://localhost:9200/geo");
        assert_eq!(b.endpoint("search"), "http://localhost:9200/geo/search");
    }
}
