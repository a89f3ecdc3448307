//! Message framing and the secured client socket. A message is the proto
//! encoding of a value behind a u32 big-endian length prefix. There is no
//! maximum receive size; reads are bounded by the caller's deadline instead.

use anyhow::{anyhow, Context as _, Result};
use drover_base::proto;
use rustls::pki_types::ServerName;
use serde::{de::DeserializeOwned, Serialize};
use slog::{debug, Logger};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

pub async fn write_message<WriteT, MessageT>(stream: &mut WriteT, msg: &MessageT) -> Result<()>
where
    WriteT: AsyncWrite + Unpin,
    MessageT: Serialize,
{
    let buf = proto::serialize(msg)?;
    stream.write_u32(buf.len().try_into()?).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_message<ReadT, MessageT>(stream: &mut ReadT) -> Result<MessageT>
where
    ReadT: AsyncRead + Unpin,
    MessageT: DeserializeOwned,
{
    let len = stream.read_u32().await?;
    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf).await?;
    proto::deserialize(&buf)
}

/// Build a TLS connector trusting either the pinned CA certificate(s) in
/// `ca_file` or the webpki roots.
pub fn tls_connector(ca_file: Option<&Path>) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    match ca_file {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("could not read CA certificate {}", path.display()))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots.add(cert?)?;
            }
            if roots.is_empty() {
                return Err(anyhow!(
                    "no certificates found in {}",
                    path.display()
                ));
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Dial `addr` and complete a TLS handshake expecting `server_name` on the
/// presented certificate.
pub async fn connect_tls(
    addr: &str,
    server_name: &str,
    ca_file: Option<&Path>,
    log: &Logger,
) -> Result<TlsStream<TcpStream>> {
    let connector = tls_connector(ca_file)?;
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| anyhow!("invalid server name {server_name}"))?;
    let stream = connector.connect(name, tcp).await?;
    debug!(log, "connected"; "addr" => addr, "server_name" => server_name);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_base::{Method, Request, Response};

    #[tokio::test]
    async fn messages_round_trip_over_a_buffer() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let req = Request::new(Method::Ping);
        write_message(&mut a, &req).await.unwrap();
        let got: Request = read_message(&mut b).await.unwrap();
        assert_eq!(got.method, Method::Ping);

        let resp = Response {
            added: 2,
            existed: 1,
            ..Default::default()
        };
        write_message(&mut b, &resp).await.unwrap();
        let got: Response = read_message(&mut a).await.unwrap();
        assert_eq!(got.added, 2);
        assert_eq!(got.existed, 1);
    }

    #[tokio::test]
    async fn short_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_u32(10).await.unwrap();
        a.write_all(b"tiny").await.unwrap();
        drop(a);
        assert!(read_message::<_, Response>(&mut b).await.is_err());
    }
}
