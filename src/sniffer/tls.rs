use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use tls_parser::{
    parse_tls_extensions, parse_tls_message_handshake, SNIType, TlsExtension, TlsMessage,
    TlsMessageHandshake,
};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::SniffStrategy;

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 22;
const TLS_RECORD_HEADER_LEN: usize = 5;

/// Recognizes a TLS ClientHello and reports its SNI server name.
///
/// Records are read one at a time and their payloads accumulated, because a
/// ClientHello is free to span any number of records. Parsing restarts from
/// the beginning of the accumulated handshake bytes after every record until
/// the message is complete or proves malformed.
pub struct TlsSniffStrategy;

#[async_trait]
impl SniffStrategy for TlsSniffStrategy {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn sniff_host_name(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        let mut handshake = BytesMut::new();

        loop {
            let mut header = [0u8; TLS_RECORD_HEADER_LEN];
            reader
                .read_exact(&mut header)
                .await
                .context("unable to read TLS record header")?;
            if header[0] != TLS_CONTENT_TYPE_HANDSHAKE {
                bail!(
                    "TLS record is not part of a handshake (content type {})",
                    header[0]
                );
            }
            let length = u16::from_be_bytes([header[3], header[4]]) as usize;
            let mut payload = vec![0u8; length];
            reader
                .read_exact(&mut payload)
                .await
                .context("TLS record payload truncated")?;
            handshake.extend_from_slice(&payload);

            match parse_tls_message_handshake(&handshake) {
                Ok((_, message)) => return extract_sni(&message),
                // The ClientHello continues in the next record.
                Err(nom::Err::Incomplete(_)) => continue,
                Err(err) => bail!("unable to parse TLS handshake: {err:?}"),
            }
        }
    }
}

fn extract_sni(message: &TlsMessage) -> Result<String> {
    let hello = match message {
        TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) => hello,
        _ => bail!("first TLS handshake message is not a ClientHello"),
    };
    let ext = hello
        .ext
        .ok_or_else(|| anyhow!("ClientHello carries no extensions"))?;
    let (_, extensions) =
        parse_tls_extensions(ext).map_err(|err| anyhow!("unable to parse TLS extensions: {err:?}"))?;

    for extension in &extensions {
        if let TlsExtension::SNI(entries) = extension {
            for (name_type, name) in entries {
                if *name_type == SNIType::HostName {
                    return Ok(std::str::from_utf8(name)
                        .context("SNI server name is not valid UTF-8")?
                        .to_owned());
                }
            }
        }
    }

    bail!("the SNI extension is absent from the ClientHello")
}
