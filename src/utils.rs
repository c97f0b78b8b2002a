use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use anyhow::{anyhow, Result};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;

const PIPE_BUF_SIZE: usize = 512 * 1024;

/// Cheap plausibility check for sniffed hostnames; no DNS involved.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.contains(" ") || !domain.contains(".") {
        return false;
    }
    return true;
}

/// Splices both directions until either side half-closes, then mirrors the
/// half-close to the peer.
pub async fn transfer_tcp(inbound: &mut TcpStream, outbound: &mut TcpStream) -> Result<()> {
    let (ri, wi) = inbound.split();
    let (ro, wo) = outbound.split();

    let client_to_server = async {
        zero_copy(ri, wo).await?;
        Ok::<(), std::io::Error>(())
    };

    let server_to_client = async {
        zero_copy(ro, wi).await?;
        Ok::<(), std::io::Error>(())
    };

    let _ = tokio::try_join!(client_to_server, server_to_client);

    Ok(())
}

struct Pipe {
    rd: OwnedFd,
    wr: OwnedFd,
}

impl Pipe {
    fn create() -> io::Result<Self> {
        let (rd, wr) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK)?;
        Ok(Pipe { rd, wr })
    }
}

#[inline]
fn splice_n(r: BorrowedFd, w: BorrowedFd, n: usize) -> io::Result<usize> {
    match nix::fcntl::splice(
        r,
        None,
        w,
        None,
        n,
        nix::fcntl::SpliceFFlags::SPLICE_F_NONBLOCK,
    ) {
        Ok(ret) => Ok(ret),
        Err(err) => Err(err.into()),
    }
}

/// Zero-copy one-directional transfer through a kernel pipe, in the manner
/// of midori's splice loop. Falls out on EOF after shutting down the write
/// side so the peer observes the half-close.
pub async fn zero_copy(r: ReadHalf<'_>, mut w: WriteHalf<'_>) -> io::Result<usize> {
    let pipe = Pipe::create()?;
    let (prd, pwr) = (pipe.rd.as_fd(), pipe.wr.as_fd());
    let rx = r.as_ref();
    let wx = w.as_ref();
    // SAFETY: the halves keep their streams alive for the whole loop
    let rfd = unsafe { BorrowedFd::borrow_raw(rx.as_raw_fd()) };
    let wfd = unsafe { BorrowedFd::borrow_raw(wx.as_raw_fd()) };

    let mut bytes = 0;

    loop {
        let mut n = rx
            .async_io(Interest::READABLE, || splice_n(rfd, pwr, PIPE_BUF_SIZE))
            .await?;

        if n == 0 {
            w.shutdown().await?;
            return Ok(bytes);
        }

        bytes += n;

        while n > 0 {
            n -= wx
                .async_io(Interest::WRITABLE, || splice_n(prd, wfd, n))
                .await?;
        }
    }
}

pub fn geteuid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap()
}

pub async fn receive_signal() -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sighang = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let signal_name = tokio::select! {
        _ = sighang.recv() => "SIGHUP",
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    tracing::error!("Received signal: {}", signal_name);

    Err(anyhow!("Received signal: {}", signal_name))
}
