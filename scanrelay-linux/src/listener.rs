//! Local listener: scanner processes connect on 127.0.0.1 and write newline-delimited lines.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::runtime::Input;

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("local port {0} already in use")]
    InUse(u16),
    #[error("cannot bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

pub async fn bind(port: u16) -> Result<TcpListener, ListenError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpListener::bind(addr).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            ListenError::InUse(port)
        } else {
            ListenError::Bind { port, source }
        }
    })
}

/// Accept producers forever; every line from every connection goes to the event loop.
pub async fn run(listener: TcpListener, tx: mpsc::UnboundedSender<Input>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "producer connected");
                tokio::spawn(read_lines(stream, peer, tx.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_lines(stream: TcpStream, peer: SocketAddr, tx: mpsc::UnboundedSender<Input>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end_matches('\r').to_string();
                if tx.send(Input::Line(line)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "producer read failed");
                break;
            }
        }
    }
    tracing::debug!(%peer, "producer disconnected");
}
