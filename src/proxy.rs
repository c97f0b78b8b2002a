use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::SETTINGS;

const RESPONSE_HEAD_LIMIT: usize = 16 * 1024;
const MAX_RESPONSE_HEADERS: usize = 32;
const READ_CHUNK: usize = 512;

/// Opens a tunnel to `origin` through the configured upstream proxy.
///
/// Returns the upstream stream together with any bytes read past the
/// response head: after a 2xx those already belong to the origin server and
/// must be delivered to the client before splicing.
pub async fn connect_upstream(origin: &str) -> Result<(TcpStream, Vec<u8>)> {
    let (proxy_addr, dial_timeout, direct_mark, disable_ipv6) = {
        let settings = SETTINGS.read().await;
        (
            settings.upstream_proxy.clone(),
            settings.dial_timeout,
            settings.intercept_mode.direct_mark(),
            settings.disable_ipv6,
        )
    };

    let addr = resolve_proxy_addr(&proxy_addr, disable_ipv6).await?;
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(mark) = direct_mark {
        // Keep our own upstream traffic out of the managed REDIRECT rules.
        // SAFETY: the fd is valid for the lifetime of socket
        let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
        nix::sys::socket::setsockopt(&fd, nix::sys::socket::sockopt::Mark, &mark)
            .context("failed to set SO_MARK on the upstream socket")?;
    }

    let mut upstream = timeout(dial_timeout, socket.connect(addr))
        .await
        .with_context(|| format!("timed out connecting to upstream proxy {}", proxy_addr))?
        .with_context(|| format!("failed to connect to upstream proxy {}", proxy_addr))?;

    let request = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    upstream
        .write_all(request.as_bytes())
        .await
        .context("failed to send the CONNECT request")?;

    let leftover = read_connect_response(&mut upstream, &proxy_addr, origin).await?;

    Ok((upstream, leftover))
}

async fn resolve_proxy_addr(proxy_addr: &str, disable_ipv6: bool) -> Result<SocketAddr> {
    let mut addrs = lookup_host(proxy_addr)
        .await
        .with_context(|| format!("failed to resolve upstream proxy {}", proxy_addr))?;

    addrs
        .find(|addr| !(disable_ipv6 && addr.is_ipv6()))
        .with_context(|| format!("upstream proxy {} resolved to no usable address", proxy_addr))
}

async fn read_connect_response(
    upstream: &mut TcpStream,
    proxy_addr: &str,
    origin: &str,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = upstream
            .read(&mut chunk)
            .await
            .context("failed to read the CONNECT response")?;
        if n == 0 {
            bail!(
                "upstream proxy {} closed the connection during CONNECT",
                proxy_addr
            );
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > RESPONSE_HEAD_LIMIT {
            bail!(
                "CONNECT response head from proxy {} exceeds {} bytes",
                proxy_addr,
                RESPONSE_HEAD_LIMIT
            );
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let code = response
                    .code
                    .context("CONNECT response carries no status code")?;
                // RFC 9110: any 2xx means the tunnel is formed right after
                // the header section; whatever follows comes from the origin.
                if !(200..300).contains(&code) {
                    bail!(
                        "CONNECT to proxy {} for origin {} returned status code {} instead of 2xx",
                        proxy_addr,
                        origin,
                        code
                    );
                }
                return Ok(buf.split_off(head_len));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(err) => bail!(
                "unable to parse the CONNECT response from proxy {}: {}",
                proxy_addr,
                err
            ),
        }
    }
}
