use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::SniffStrategy;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 512;

/// Recognizes an HTTP/1.x request head and reports its `Host` header.
///
/// Only the request line and headers are read; the body, if any, stays in
/// the stream.
pub struct HttpSniffStrategy;

#[async_trait]
impl SniffStrategy for HttpSniffStrategy {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn sniff_host_name(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                bail!("connection closed before the HTTP header section ended");
            }
            buf.extend_from_slice(&chunk[..n]);

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buf) {
                Ok(httparse::Status::Complete(_)) => {
                    let host = request
                        .headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("host"))
                        .map(|h| std::str::from_utf8(h.value))
                        .transpose()?
                        .map(|v| v.trim().to_owned())
                        .unwrap_or_default();
                    if host.is_empty() {
                        bail!("HTTP Host header is missing or empty");
                    }
                    return Ok(host);
                }
                Ok(httparse::Status::Partial) => continue,
                Err(err) => return Err(anyhow!("unable to parse HTTP request: {err}")),
            }
        }
    }
}
