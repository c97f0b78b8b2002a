mod http;
mod parallel;
mod tls;

#[cfg(test)]
mod tests;

pub use http::HttpSniffStrategy;
pub use parallel::ParallelSniffer;
pub use tls::TlsSniffStrategy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

pub const SNIFF_DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const SNIFF_DEFAULT_MAX_DATA: usize = 8192;

/// Outcome classification for a sniffing attempt.
///
/// Only `Fatal` means the connection is beyond saving: bytes were consumed
/// from the socket and the stream can no longer be reconstructed. Every
/// other variant leaves the buffered prefix faithful, so the caller can
/// replay it and keep tunneling to the original destination.
#[derive(Debug, Error)]
pub enum SniffError {
    /// Every configured strategy returned an empty verdict.
    #[error("all hostname sniffing strategies failed")]
    Exhausted,
    /// The read budget ran out (deadline, byte cap or clean EOF) before any
    /// strategy committed.
    #[error("hostname sniff deadline expired or data limit reached")]
    TimeoutOrDataLimitExceeded,
    /// The client stream broke mid-read; the captured prefix may no longer
    /// reproduce the original byte stream.
    #[error("hostname sniffing lost stream data: {0}")]
    Fatal(#[source] std::io::Error),
}

impl SniffError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SniffError::Fatal(_))
    }
}

/// Classifier for callers that already folded the error into `anyhow`.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SniffError>()
        .is_some_and(SniffError::is_fatal)
}

/// A single protocol recognizer.
///
/// Strategies consume bytes from their private view of the client stream and
/// either produce the hostname the client asked for or fail. EOF and short
/// reads are ordinary failures. Strategies never enforce timeouts; budget
/// governance belongs to the orchestrator that owns the socket.
#[async_trait]
pub trait SniffStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sniff_host_name(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<String>;
}

/// One-shot hostname extraction over a client connection.
///
/// After `sniff_host_name` returns, `take_buffered_data` yields every byte
/// that was consumed from the connection, in order, so the caller can replay
/// it to the upstream before splicing. The prefix is only meaningful when
/// the outcome was not fatal.
#[async_trait]
pub trait HostNameSniffer: Send {
    async fn sniff_host_name(
        &mut self,
        conn: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String, SniffError>;

    fn take_buffered_data(&mut self) -> Bytes;
}

/// Stand-in used when sniffing is disabled: always fails, captures nothing.
pub struct NullSniffer;

#[async_trait]
impl HostNameSniffer for NullSniffer {
    async fn sniff_host_name(
        &mut self,
        _conn: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String, SniffError> {
        Err(SniffError::Exhausted)
    }

    fn take_buffered_data(&mut self) -> Bytes {
        Bytes::new()
    }
}

pub fn strategy_by_name(name: &str) -> Option<Arc<dyn SniffStrategy>> {
    match name {
        "http" => Some(Arc::new(HttpSniffStrategy)),
        "tls" => Some(Arc::new(TlsSniffStrategy)),
        _ => None,
    }
}

/// Build the per-connection sniffer selected by the configuration.
pub fn from_settings(mode: &crate::settings::SniffMode) -> Box<dyn HostNameSniffer> {
    match mode {
        crate::settings::SniffMode::Disabled => Box::new(NullSniffer),
        crate::settings::SniffMode::Parallel {
            timeout,
            max_data,
            strategies,
        } => {
            let strategies = strategies
                .iter()
                .filter_map(|name| strategy_by_name(name))
                .collect();
            Box::new(ParallelSniffer::new(strategies, *timeout, *max_data))
        }
    }
}
