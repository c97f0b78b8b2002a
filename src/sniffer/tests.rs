use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

use super::{
    HostNameSniffer, HttpSniffStrategy, NullSniffer, ParallelSniffer, SniffError, SniffStrategy,
    TlsSniffStrategy,
};

const TLS_TEST_SNI: &str = "www.tlsname.test.com";

async fn strategy_verdict(strategy: &dyn SniffStrategy, input: &[u8]) -> anyhow::Result<String> {
    let mut reader: &[u8] = input;
    strategy.sniff_host_name(&mut reader).await
}

/// Streams `request` into the sniffer through an in-memory connection that
/// stays open for the whole attempt, then returns the verdict, the bytes the
/// sniffer left unread and the captured prefix.
async fn sniff_via_conn(
    sniffer: &mut dyn HostNameSniffer,
    request: &[u8],
) -> (Result<String, SniffError>, Vec<u8>, Bytes) {
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);
    client.write_all(request).await.unwrap();

    let verdict = sniffer.sniff_host_name(&mut server).await;

    drop(client);
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();

    (verdict, rest, sniffer.take_buffered_data())
}

fn check_rebuilt_request(original: &[u8], prefix: &Bytes, rest: &[u8]) {
    let mut rebuilt = prefix.to_vec();
    rebuilt.extend_from_slice(rest);
    assert_eq!(original, rebuilt.as_slice());
}

struct StubStrategy(Option<&'static str>);

#[async_trait]
impl SniffStrategy for StubStrategy {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn sniff_host_name(
        &self,
        _reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<String> {
        match self.0 {
            Some(host) => Ok(host.to_owned()),
            None => bail!("stub strategy always fails"),
        }
    }
}

/// Succeeds only after the stream produced at least one byte.
struct ReadOneStrategy;

#[async_trait]
impl SniffStrategy for ReadOneStrategy {
    fn name(&self) -> &'static str {
        "read-one"
    }

    async fn sniff_host_name(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<String> {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        Ok("www.example.com".to_owned())
    }
}

/// Consumes everything and never produces a hostname.
struct DrainStrategy;

#[async_trait]
impl SniffStrategy for DrainStrategy {
    fn name(&self) -> &'static str {
        "drain"
    }

    async fn sniff_host_name(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<String> {
        tokio::io::copy(reader, &mut tokio::io::sink()).await?;
        bail!("drain strategy never commits")
    }
}

/// A connection that fails on the first read, as a broken socket would.
struct BrokenConn;

impl AsyncRead for BrokenConn {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by test",
        )))
    }
}

fn parallel(strategies: Vec<Arc<dyn SniffStrategy>>) -> ParallelSniffer {
    ParallelSniffer::new(strategies, Duration::ZERO, 0)
}

/// Request shaped like what an ordinary HTTP client library emits: path,
/// common headers, a Content-Length when there is a body.
fn client_request(method: &str, host: &str, body: &str) -> String {
    let mut request = format!(
        "{} /my/page.htm HTTP/1.1\r\nHost: {}\r\nUser-Agent: curl/8.5.0\r\nAccept: */*\r\n",
        method, host
    );
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    request.push_str(body);
    request
}

// (description, request, expected hostname)
fn http_test_table() -> Vec<(&'static str, String, Option<&'static str>)> {
    vec![
        ("empty request", String::new(), None),
        ("GET request no Host header", "GET / HTTP/1.1\r\n\r\n".into(), None),
        (
            "GET request no Host header but other headers",
            "GET / HTTP/1.1\r\nAccept: text/plain\r\n\r\n".into(),
            None,
        ),
        (
            "GET request, misspelled Host header",
            "GET / HTTP/1.1\r\nHosts: www.example.com\r\n\r\n".into(),
            None,
        ),
        (
            "GET request, empty Host header",
            "GET / HTTP/1.1\r\nHost:\r\n\r\n".into(),
            None,
        ),
        (
            "GET request, empty Host header with trailing space",
            "GET / HTTP/1.1\r\nHost: \r\n\r\n".into(),
            None,
        ),
        ("truncated request line", "GET / HTTP/1.".into(), None),
        (
            "POST request, no Host header, empty body",
            "POST / HTTP/1.1\r\n\r\n".into(),
            None,
        ),
        (
            "POST request, no Host header, with body",
            "POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nDATA".into(),
            None,
        ),
        (
            "POST request, no Host header, body longer than declared",
            "POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nDATA".into(),
            None,
        ),
        (
            "POST request, no Host header, truncated body",
            "POST / HTTP/1.1\r\nContent-Length: 8\r\n\r\nDATA".into(),
            None,
        ),
        (
            "GET request, Host header",
            "GET / HTTP/1.1\r\nHost: www.example.com\r\n\r\n".into(),
            Some("www.example.com"),
        ),
        (
            "GET request, Host header with port",
            "GET / HTTP/1.1\r\nHost: www.example.com:8080\r\n\r\n".into(),
            Some("www.example.com:8080"),
        ),
        (
            "POST request, Host header and payload",
            "POST / HTTP/1.1\r\nHost: www.example.com\r\nContent-Length: 4\r\n\r\nDATA".into(),
            Some("www.example.com"),
        ),
        (
            "HEAD request, Host header",
            "HEAD / HTTP/1.1\r\nHost: www.example.com\r\n\r\n".into(),
            Some("www.example.com"),
        ),
        (
            "PUT request, Host header and payload",
            "PUT /my/page.htm HTTP/1.1\r\nHost: www.foo.bar:8080\r\nContent-Length: 14\r\n\r\nSample payload".into(),
            Some("www.foo.bar:8080"),
        ),
        (
            "GET request shaped like a real client",
            client_request("GET", "www.foo.bar:8080", ""),
            Some("www.foo.bar:8080"),
        ),
        (
            "POST request shaped like a real client",
            client_request("POST", "www.foo.bar:8080", "Sample payload"),
            Some("www.foo.bar:8080"),
        ),
        (
            "PUT request shaped like a real client",
            client_request("PUT", "www.foo.bar:8080", "Sample payload"),
            Some("www.foo.bar:8080"),
        ),
    ]
}

// Hand-built ClientHello, fragmentable over any number of TLS records.
fn client_hello(sni: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0); // empty session id
    let suites: &[u16] = &[0x1301, 0x1302, 0xc02f];
    body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
    for suite in suites {
        body.extend_from_slice(&suite.to_be_bytes());
    }
    body.extend_from_slice(&[1, 0]); // null compression only

    let mut extensions = Vec::new();
    if let Some(name) = sni {
        let mut list = Vec::new();
        list.push(0u8); // host_name
        list.extend_from_slice(&(name.len() as u16).to_be_bytes());
        list.extend_from_slice(name.as_bytes());
        extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name
        extensions.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
        extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&list);
    }
    // supported_versions, so the extension walk has something to skip
    extensions.extend_from_slice(&43u16.to_be_bytes());
    extensions.extend_from_slice(&3u16.to_be_bytes());
    extensions.extend_from_slice(&[2, 0x03, 0x04]);

    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut message = vec![0x01]; // client_hello
    message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    message.extend_from_slice(&body);
    message
}

fn into_records(message: &[u8], fragments: usize) -> Vec<u8> {
    let per_record = (message.len() / fragments).max(1);
    let mut out = Vec::new();
    for part in message.chunks(per_record) {
        out.extend_from_slice(&[22, 0x03, 0x03]);
        out.extend_from_slice(&(part.len() as u16).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

fn tls_test_table() -> Vec<(&'static str, Vec<u8>, Option<&'static str>)> {
    vec![
        ("empty stream", Vec::new(), None),
        ("one zero byte", vec![0u8], None),
        ("sixteen zero bytes", vec![0u8; 16], None),
        (
            "ClientHello without SNI, 1 record",
            into_records(&client_hello(None), 1),
            None,
        ),
        (
            "ClientHello without SNI, one byte per record",
            into_records(&client_hello(None), usize::MAX),
            None,
        ),
        (
            "ClientHello with SNI, 1 record",
            into_records(&client_hello(Some(TLS_TEST_SNI)), 1),
            Some(TLS_TEST_SNI),
        ),
        (
            "ClientHello with SNI, 2 records",
            into_records(&client_hello(Some(TLS_TEST_SNI)), 2),
            Some(TLS_TEST_SNI),
        ),
        (
            "ClientHello with SNI, 16 records",
            into_records(&client_hello(Some(TLS_TEST_SNI)), 16),
            Some(TLS_TEST_SNI),
        ),
        (
            "ClientHello with SNI, one byte per record",
            into_records(&client_hello(Some(TLS_TEST_SNI)), usize::MAX),
            Some(TLS_TEST_SNI),
        ),
        (
            "application data record instead of handshake",
            vec![23, 0x03, 0x03, 0, 1, 0xff],
            None,
        ),
    ]
}

#[tokio::test]
async fn http_strategy_table() {
    for (description, request, expected) in http_test_table() {
        let verdict = strategy_verdict(&HttpSniffStrategy, request.as_bytes()).await;
        match expected {
            Some(host) => assert_eq!(host, verdict.expect(description)),
            None => assert!(verdict.is_err(), "{}", description),
        }
    }
}

#[tokio::test]
async fn tls_strategy_table() {
    for (description, request, expected) in tls_test_table() {
        let verdict = strategy_verdict(&TlsSniffStrategy, &request).await;
        match expected {
            Some(host) => assert_eq!(host, verdict.expect(description)),
            None => assert!(verdict.is_err(), "{}", description),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_with_http_strategy_only() {
    for (description, request, expected) in http_test_table() {
        let mut sniffer = parallel(vec![Arc::new(HttpSniffStrategy)]);
        let (verdict, rest, prefix) = sniff_via_conn(&mut sniffer, request.as_bytes()).await;
        match expected {
            Some(host) => assert_eq!(host, verdict.expect(description)),
            None => {
                let err = verdict.expect_err(description);
                assert!(!err.is_fatal(), "{}", description);
            }
        }
        check_rebuilt_request(request.as_bytes(), &prefix, &rest);
    }
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_with_tls_strategy_only() {
    for (description, request, expected) in tls_test_table() {
        let mut sniffer = parallel(vec![Arc::new(TlsSniffStrategy)]);
        let (verdict, rest, prefix) = sniff_via_conn(&mut sniffer, &request).await;
        match expected {
            Some(host) => assert_eq!(host, verdict.expect(description)),
            None => {
                let err = verdict.expect_err(description);
                assert!(!err.is_fatal(), "{}", description);
            }
        }
        check_rebuilt_request(&request, &prefix, &rest);
    }
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_with_both_strategies() {
    for (description, request, expected) in http_test_table() {
        let mut sniffer = parallel(vec![Arc::new(HttpSniffStrategy), Arc::new(TlsSniffStrategy)]);
        let (verdict, rest, prefix) = sniff_via_conn(&mut sniffer, request.as_bytes()).await;
        match expected {
            Some(host) => assert_eq!(host, verdict.expect(description)),
            None => assert!(verdict.is_err(), "{}", description),
        }
        check_rebuilt_request(request.as_bytes(), &prefix, &rest);
    }
    for (description, request, expected) in tls_test_table() {
        let mut sniffer = parallel(vec![Arc::new(HttpSniffStrategy), Arc::new(TlsSniffStrategy)]);
        let (verdict, rest, prefix) = sniff_via_conn(&mut sniffer, &request).await;
        match expected {
            Some(host) => assert_eq!(host, verdict.expect(description)),
            None => assert!(verdict.is_err(), "{}", description),
        }
        check_rebuilt_request(&request, &prefix, &rest);
    }
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_with_a_failing_stub() {
    let mut sniffer = parallel(vec![Arc::new(StubStrategy(None))]);
    let (verdict, _, prefix) = sniff_via_conn(&mut sniffer, b"").await;
    let err = verdict.unwrap_err();
    assert!(matches!(err, SniffError::Exhausted));
    assert!(!err.is_fatal());
    assert!(prefix.is_empty());
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_with_a_successful_stub() {
    let mut sniffer = parallel(vec![Arc::new(StubStrategy(Some("www.example.com")))]);
    let (verdict, _, _) = sniff_via_conn(&mut sniffer, b"").await;
    assert_eq!("www.example.com", verdict.unwrap());
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_with_a_successful_and_a_failing_stub() {
    let mut sniffer = parallel(vec![
        Arc::new(StubStrategy(Some("www.example.com"))),
        Arc::new(StubStrategy(None)),
    ]);
    let (verdict, _, _) = sniff_via_conn(&mut sniffer, b"").await;
    assert_eq!("www.example.com", verdict.unwrap());
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_hits_the_deadline() {
    // The strategy needs one byte to commit and the stream never produces
    // one, so the deadline must fire and classify as recoverable.
    let mut sniffer = parallel(vec![Arc::new(ReadOneStrategy)]);
    let (verdict, _, prefix) = sniff_via_conn(&mut sniffer, b"").await;
    let err = verdict.unwrap_err();
    assert!(matches!(err, SniffError::TimeoutOrDataLimitExceeded));
    assert!(!err.is_fatal());
    assert!(prefix.is_empty());
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_hits_the_byte_cap() {
    const MAX_DATA: usize = 16;
    let noise = vec![0xa5u8; MAX_DATA];

    let mut sniffer = ParallelSniffer::new(
        vec![Arc::new(DrainStrategy)],
        // Far enough away that reaching it would fail the virtual-time check
        // below.
        Duration::from_secs(3600),
        MAX_DATA,
    );

    let started = tokio::time::Instant::now();
    let (verdict, rest, prefix) = sniff_via_conn(&mut sniffer, &noise).await;
    assert!(started.elapsed() < Duration::from_secs(3600));

    let err = verdict.unwrap_err();
    assert!(matches!(err, SniffError::TimeoutOrDataLimitExceeded));
    assert_eq!(MAX_DATA, prefix.len());
    check_rebuilt_request(&noise, &prefix, &rest);
}

#[tokio::test(start_paused = true)]
async fn parallel_sniffer_never_reads_past_the_cap() {
    const MAX_DATA: usize = 8;
    let input = vec![0x42u8; 64];

    let mut sniffer =
        ParallelSniffer::new(vec![Arc::new(DrainStrategy)], Duration::from_secs(3600), MAX_DATA);
    let (verdict, rest, prefix) = sniff_via_conn(&mut sniffer, &input).await;

    assert!(verdict.is_err());
    assert_eq!(MAX_DATA, prefix.len());
    assert_eq!(input.len() - MAX_DATA, rest.len());
    check_rebuilt_request(&input, &prefix, &rest);
}

#[tokio::test]
async fn parallel_sniffer_classifies_a_broken_stream_as_fatal() {
    let mut conn = BrokenConn;
    let mut sniffer = parallel(vec![Arc::new(HttpSniffStrategy)]);
    let err = sniffer.sniff_host_name(&mut conn).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(super::is_fatal(&anyhow::Error::new(err)));
}

#[tokio::test]
async fn recoverable_errors_are_not_fatal_through_anyhow() {
    assert!(!super::is_fatal(&anyhow::Error::new(SniffError::Exhausted)));
    assert!(!super::is_fatal(&anyhow::Error::new(
        SniffError::TimeoutOrDataLimitExceeded
    )));
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "cannot be reused")]
async fn parallel_sniffer_cannot_be_reused() {
    let mut sniffer = parallel(vec![Arc::new(StubStrategy(Some("www.example.com")))]);
    let (verdict, _, _) = sniff_via_conn(&mut sniffer, b"").await;
    assert!(verdict.is_ok());

    let (_, mut server) = tokio::io::duplex(64);
    let _ = sniffer.sniff_host_name(&mut server).await;
}

#[test]
#[should_panic(expected = "without any strategy")]
fn parallel_sniffer_requires_a_strategy() {
    let _ = ParallelSniffer::new(Vec::new(), Duration::ZERO, 0);
}

#[tokio::test]
async fn null_sniffer_always_fails_with_an_empty_prefix() {
    let (_, mut server) = tokio::io::duplex(64);
    let mut sniffer = NullSniffer;
    let err = sniffer.sniff_host_name(&mut server).await.unwrap_err();
    assert!(!err.is_fatal());
    assert!(sniffer.take_buffered_data().is_empty());
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn both_strategies() -> Vec<Arc<dyn SniffStrategy>> {
        vec![Arc::new(HttpSniffStrategy), Arc::new(TlsSniffStrategy)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Whatever the client sends and however it is chunked, a non-fatal
        // attempt must leave prefix ++ remainder identical to the stream.
        #[test]
        fn replay_is_faithful_for_arbitrary_streams(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..8)
        ) {
            runtime().block_on(async {
                let input: Vec<u8> = chunks.concat();
                let (mut client, mut server) = tokio::io::duplex(16 * 1024);
                for chunk in &chunks {
                    client.write_all(chunk).await.unwrap();
                }
                drop(client);

                let mut sniffer =
                    ParallelSniffer::new(both_strategies(), Duration::from_secs(5), 0);
                let verdict = sniffer.sniff_host_name(&mut server).await;
                if let Err(err) = &verdict {
                    prop_assert!(!err.is_fatal());
                }

                let mut rest = Vec::new();
                server.read_to_end(&mut rest).await.unwrap();
                let mut rebuilt = sniffer.take_buffered_data().to_vec();
                rebuilt.extend_from_slice(&rest);
                prop_assert_eq!(input, rebuilt);
                Ok(())
            })?;
        }

        #[test]
        fn http_host_is_always_extracted(
            host in "[a-z]{1,12}\\.[a-z]{2,6}",
            port in proptest::option::of(1u16..),
        ) {
            runtime().block_on(async {
                let host_header = match port {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.clone(),
                };
                let request = format!(
                    "GET / HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\n\r\n",
                    host_header
                );

                let (mut client, mut server) = tokio::io::duplex(16 * 1024);
                client.write_all(request.as_bytes()).await.unwrap();

                let mut sniffer =
                    ParallelSniffer::new(both_strategies(), Duration::from_secs(5), 0);
                let verdict = sniffer.sniff_host_name(&mut server).await;
                prop_assert_eq!(&host_header, &verdict.unwrap());

                drop(client);
                let mut rest = Vec::new();
                server.read_to_end(&mut rest).await.unwrap();
                let mut rebuilt = sniffer.take_buffered_data().to_vec();
                rebuilt.extend_from_slice(&rest);
                prop_assert_eq!(request.as_bytes(), rebuilt.as_slice());
                Ok(())
            })?;
        }

        #[test]
        fn tls_sni_survives_any_fragmentation(fragments in 1usize..40) {
            runtime().block_on(async {
                let stream = into_records(&client_hello(Some(TLS_TEST_SNI)), fragments);

                let (mut client, mut server) = tokio::io::duplex(16 * 1024);
                client.write_all(&stream).await.unwrap();

                let mut sniffer =
                    ParallelSniffer::new(both_strategies(), Duration::from_secs(5), 0);
                let verdict = sniffer.sniff_host_name(&mut server).await;
                prop_assert_eq!(TLS_TEST_SNI, verdict.unwrap());
                Ok(())
            })?;
        }
    }
}
