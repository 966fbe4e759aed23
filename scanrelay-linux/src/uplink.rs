//! Uplink to the collector: TLS over TCP carrying length-prefixed frames.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use scanrelay_core::wire::{LEN_SIZE, MAX_FRAME_LEN};
use scanrelay_core::ConnectError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::runtime::Input;
use crate::tls;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Events from one connection attempt, tagged with its link id by the sender.
pub enum LinkEvent {
    Opened(Box<TlsStream<TcpStream>>),
    Failed(ConnectError),
    /// One payload, length prefix removed.
    Frame(Vec<u8>),
    Closed(String),
    /// The collector ended an open link with a fatal alert.
    Rejected(ConnectError),
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::Opened(_) => f.write_str("Opened"),
            LinkEvent::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            LinkEvent::Frame(p) => write!(f, "Frame({} bytes)", p.len()),
            LinkEvent::Closed(reason) => f.debug_tuple("Closed").field(reason).finish(),
            LinkEvent::Rejected(e) => f.debug_tuple("Rejected").field(e).finish(),
        }
    }
}

#[derive(Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: Arc<ClientConfig>,
}

impl Target {
    pub fn server_name(&self) -> Result<ServerName<'static>, ConnectError> {
        ServerName::try_from(self.host.clone())
            .map_err(|e| ConnectError::Transient(format!("invalid server name {}: {e}", self.host)))
    }
}

pub async fn connect(target: &Target) -> Result<TlsStream<TcpStream>, ConnectError> {
    let server_name = target.server_name()?;
    let tcp = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| ConnectError::Transient("connect timed out".into()))?
    .map_err(|e| ConnectError::Transient(e.to_string()))?;
    let _ = tcp.set_nodelay(true);

    let connector = TlsConnector::from(target.tls.clone());
    tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ConnectError::Transient("TLS handshake timed out".into()))?
        .map_err(|e| tls::classify(&e))
}

/// Read frames until EOF or error; each payload goes to the event loop. Always ends with
/// `Closed` or `Rejected`.
pub async fn read_frames<R>(mut reader: R, id: u64, tx: mpsc::UnboundedSender<Input>)
where
    R: AsyncRead + Unpin,
{
    let last = loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            break read_failed(&e);
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            break LinkEvent::Closed(format!("frame of {len} bytes exceeds limit"));
        }
        let mut payload = vec![0u8; len as usize];
        if let Err(e) = reader.read_exact(&mut payload).await {
            break read_failed(&e);
        }
        if tx.send(Input::Link(id, LinkEvent::Frame(payload))).is_err() {
            return;
        }
    };
    let _ = tx.send(Input::Link(id, last));
}

fn read_failed(err: &std::io::Error) -> LinkEvent {
    match tls::classify(err) {
        rejected @ ConnectError::CredentialsRejected(_) => LinkEvent::Rejected(rejected),
        _ => LinkEvent::Closed(err.to_string()),
    }
}

/// Write queued frames in order. Reports `Closed` on a write error.
pub async fn write_frames<W>(
    mut writer: W,
    id: u64,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Input>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let res = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = res {
            let _ = tx.send(Input::Link(id, LinkEvent::Closed(e.to_string())));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, BasicConstraints, CertificateParams, IsCa, KeyPair};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::server::WebPkiClientVerifier;
    use rustls::{RootCertStore, ServerConfig};
    use scanrelay_core::protocol::{Body, Message};
    use scanrelay_core::{wire, ExitStatus};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn key_der(key: &KeyPair) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(key.serialize_der()).into()
    }

    #[tokio::test]
    async fn reads_frames_then_closed() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(read_frames(server, 7, tx));

        let frame = wire::encode_frame(&Message::new(Body::HostnameRequest)).unwrap();
        client.write_all(&frame).await.unwrap();
        // Partial second frame, then EOF.
        client.write_all(&frame[..3]).await.unwrap();
        drop(client);

        match rx.recv().await {
            Some(Input::Link(7, LinkEvent::Frame(payload))) => {
                assert_eq!(payload, frame[LEN_SIZE..].to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(Input::Link(7, LinkEvent::Closed(_)))
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_closes() {
        let (mut client, server) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(read_frames(server, 1, tx));
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(Input::Link(1, LinkEvent::Closed(_)))
        ));
    }

    #[tokio::test]
    async fn writes_frames_in_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_frames(client, 1, frames_rx, tx));
        frames_tx.send(b"ab".to_vec()).unwrap();
        frames_tx.send(b"cd".to_vec()).unwrap();
        drop(frames_tx);
        task.await.unwrap();
        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcd");
    }

    #[tokio::test]
    async fn collector_rejecting_client_certificate() {
        let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        let server = generate_simple_self_signed(names).unwrap();
        let client = generate_simple_self_signed(vec!["relay".to_string()]).unwrap();

        // The collector only trusts client certificates issued by its own CA.
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();
        let mut client_roots = RootCertStore::empty();
        client_roots.add(ca.der().clone()).unwrap();
        let verifier = WebPkiClientVerifier::builder(Arc::new(client_roots))
            .build()
            .unwrap();
        let server_cfg = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![server.cert.der().clone()], key_der(&server.key_pair))
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_cfg));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let collector = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            acceptor.accept(tcp).await.is_err()
        });

        let mut roots = RootCertStore::empty();
        roots.add(server.cert.der().clone()).unwrap();
        let client_cfg = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(vec![client.cert.der().clone()], key_der(&client.key_pair))
            .unwrap();
        let target = Target {
            host: "127.0.0.1".into(),
            port,
            tls: Arc::new(client_cfg),
        };

        // TLS 1.2 fails the handshake itself; under TLS 1.3 the alert follows it.
        let err = match connect(&target).await {
            Err(e) => e,
            Ok(stream) => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                tokio::spawn(read_frames(stream, 1, tx));
                match rx.recv().await {
                    Some(Input::Link(1, LinkEvent::Rejected(e))) => e,
                    other => panic!("unexpected {other:?}"),
                }
            }
        };
        assert!(matches!(err, ConnectError::CredentialsRejected(_)));
        assert_eq!(err.exit_status(), Some(ExitStatus::CredentialsRejected));
        assert!(collector.await.unwrap());
    }
}
