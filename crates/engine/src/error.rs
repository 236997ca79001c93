use streaming::backend::BackendError;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration value `{0}`")]
    Missing(&'static str),
    #[error("invalid configuration value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The cardinality probe failed; the previous strategy is kept.
    #[error("cardinality probe failed: {0}")]
    Probe(#[source] BackendError),
    /// One fetch failed; it contributes no features this round.
    #[error("fetch for {scope} failed: {source}")]
    Fetch {
        scope: String,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("engine task has stopped")]
    Closed,
}

/// Shared sink for errors the engine reports but does not propagate.
#[derive(Debug, Clone)]
pub struct ErrorChannel {
    tx: mpsc::UnboundedSender<EngineError>,
}

impl ErrorChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, err: EngineError) {
        warn!(error = %err, "engine error reported");
        // A dropped receiver means nobody listens; the warning above still records it.
        let _ = self.tx.send(err);
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineError, ErrorChannel};
    use streaming::backend::BackendError;

    #[test]
    fn reported_errors_reach_the_receiver() {
        let (channel, mut rx) = ErrorChannel::new();
        channel.report(EngineError::Fetch {
            scope: "u09".into(),
            source: BackendError::Transport("reset".into()),
        });

        let err = rx.try_recv().expect("error delivered");
        assert_eq!(
            err.to_string(),
            "fetch for u09 failed: backend transport failed: reset"
        );
    }

    #[test]
    fn reporting_without_receiver_does_not_panic() {
        let (channel, rx) = ErrorChannel::new();
        drop(rx);
        channel.report(EngineError::Closed);
    }
}
