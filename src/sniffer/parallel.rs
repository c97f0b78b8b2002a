use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::io::{simplex, AsyncRead, AsyncReadExt, AsyncWriteExt, SimplexStream, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{HostNameSniffer, SniffError, SniffStrategy, SNIFF_DEFAULT_MAX_DATA, SNIFF_DEFAULT_TIMEOUT};

/// Per-strategy pipe capacity. Strategies that fall behind are never allowed
/// to stall the group for long: once a strategy has emitted its verdict it
/// keeps draining its pipe until EOF.
const STRATEGY_PIPE_CAPACITY: usize = 8 * 1024;

const READ_CHUNK: usize = 2048;

/// Runs several [`SniffStrategy`] recognizers in parallel over a single
/// read-once client stream.
///
/// The socket is pumped into one pipe per strategy plus an internal prefix
/// buffer, so that every byte taken off the wire can later be replayed to
/// the upstream. Pumping stops at the first committed verdict, when every
/// strategy has failed, or when the time/byte budget runs out.
pub struct ParallelSniffer {
    strategies: Vec<Arc<dyn SniffStrategy>>,
    timeout: Duration,
    max_data: usize,
    buffered: BytesMut,
    spent: bool,
}

impl ParallelSniffer {
    /// Panics when `strategies` is empty; zero `timeout`/`max_data` select
    /// the defaults.
    pub fn new(strategies: Vec<Arc<dyn SniffStrategy>>, timeout: Duration, max_data: usize) -> Self {
        assert!(
            !strategies.is_empty(),
            "parallel sniffer configured without any strategy"
        );
        ParallelSniffer {
            strategies,
            timeout: if timeout.is_zero() {
                SNIFF_DEFAULT_TIMEOUT
            } else {
                timeout
            },
            max_data: if max_data == 0 {
                SNIFF_DEFAULT_MAX_DATA
            } else {
                max_data
            },
            buffered: BytesMut::new(),
            spent: false,
        }
    }
}

#[async_trait]
impl HostNameSniffer for ParallelSniffer {
    async fn sniff_host_name(
        &mut self,
        conn: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String, SniffError> {
        assert!(!self.spent, "parallel sniffer instances cannot be reused");
        self.spent = true;

        let outstanding = self.strategies.len();
        // One slot per strategy: a verdict send can never block.
        let (verdict_tx, mut verdict_rx) = mpsc::channel::<String>(outstanding);
        let mut sinks = Vec::with_capacity(outstanding);
        let mut tasks = Vec::with_capacity(outstanding);
        for strategy in &self.strategies {
            let (mut pipe, sink) = simplex(STRATEGY_PIPE_CAPACITY);
            sinks.push(sink);
            let strategy = Arc::clone(strategy);
            let verdict_tx = verdict_tx.clone();
            tasks.push(tokio::spawn(async move {
                let verdict = match strategy.sniff_host_name(&mut pipe).await {
                    Ok(host) => host,
                    Err(err) => {
                        debug!("{} sniffing strategy failed: {:#}", strategy.name(), err);
                        String::new()
                    }
                };
                let _ = verdict_tx.send(verdict).await;
                // Keep consuming, otherwise the fan-out would stall on a
                // strategy that already made up its mind.
                let _ = tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await;
            }));
        }
        drop(verdict_tx);

        let deadline = Instant::now() + self.timeout;
        let result = race_verdicts(
            conn,
            sinks,
            &mut self.buffered,
            self.max_data,
            deadline,
            &mut verdict_rx,
            outstanding,
        )
        .await;

        // Losing strategies are abandoned mid-parse; joining them releases
        // their pipe buffers before the prefix is handed to the caller.
        for task in tasks {
            let _ = task.await;
        }

        result
    }

    fn take_buffered_data(&mut self) -> Bytes {
        self.buffered.split().freeze()
    }
}

/// How the pump stopped reading, pre-bucketed so the main loop never has to
/// inspect raw I/O errors.
enum ReadOutcome {
    TimedOut,
    Capped,
    CleanEof,
    Failed(std::io::Error),
}

/// Multiplexes strategy verdicts against pump termination.
///
/// Returning from this function drops the pump, which closes the fan-out
/// writers and surfaces EOF to every strategy pipe. The select is biased
/// toward the verdict channel so a verdict delivered before the pump
/// terminated always wins the race.
async fn race_verdicts(
    conn: &mut (dyn AsyncRead + Send + Unpin),
    sinks: Vec<WriteHalf<SimplexStream>>,
    buffered: &mut BytesMut,
    max_data: usize,
    deadline: Instant,
    verdicts: &mut mpsc::Receiver<String>,
    mut outstanding: usize,
) -> Result<String, SniffError> {
    let mut pump_fut = pin!(pump(conn, sinks, buffered, max_data, deadline));

    loop {
        tokio::select! {
            biased;
            verdict = verdicts.recv() => match verdict {
                Some(host) if !host.is_empty() => {
                    // The pump may already have died on the socket; stream
                    // integrity takes precedence over the verdict.
                    return match (&mut pump_fut).now_or_never() {
                        Some(ReadOutcome::Failed(cause)) => Err(SniffError::Fatal(cause)),
                        _ => Ok(host),
                    };
                }
                Some(_) => {
                    outstanding -= 1;
                    if outstanding == 0 {
                        return match (&mut pump_fut).now_or_never() {
                            Some(ReadOutcome::Failed(cause)) => Err(SniffError::Fatal(cause)),
                            _ => Err(SniffError::Exhausted),
                        };
                    }
                }
                // Unreachable while the pump holds the pipe writers, kept
                // total for safety.
                None => return Err(SniffError::Exhausted),
            },
            outcome = &mut pump_fut => return match outcome {
                ReadOutcome::Failed(cause) => Err(SniffError::Fatal(cause)),
                _ => Err(SniffError::TimeoutOrDataLimitExceeded),
            },
        }
    }
}

/// Pulls bytes off the client connection and pushes them to every strategy
/// pipe, recording each chunk in the prefix buffer first so the caller can
/// replay the stream whatever happens next.
async fn pump(
    conn: &mut (dyn AsyncRead + Send + Unpin),
    mut sinks: Vec<WriteHalf<SimplexStream>>,
    buffered: &mut BytesMut,
    max_data: usize,
    deadline: Instant,
) -> ReadOutcome {
    let mut chunk = [0u8; READ_CHUNK];
    let mut copied = 0usize;

    while copied < max_data {
        let want = chunk.len().min(max_data - copied);
        let n = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return ReadOutcome::TimedOut,
            read = conn.read(&mut chunk[..want]) => match read {
                Ok(0) => return ReadOutcome::CleanEof,
                Ok(n) => n,
                Err(cause) => return ReadOutcome::Failed(cause),
            },
        };
        buffered.extend_from_slice(&chunk[..n]);
        copied += n;
        for sink in &mut sinks {
            // A strategy whose pipe vanished must not take the group down.
            let _ = sink.write_all(&chunk[..n]).await;
        }
    }

    ReadOutcome::Capped
}
