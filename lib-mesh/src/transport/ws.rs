//! WebSocket transports
//!
//! The outbound dialer and the listening server both reduce a WebSocket
//! stream to a [`TransportLink`] by spawning two pump tasks: one drains the
//! outbound channel into the sink, one feeds inbound text frames into the
//! channel. Either side closing ends both pumps.

use crate::error::MeshError;
use crate::transport::{LinkKind, TransportLink, LINK_CHANNEL_DEPTH};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Dial a remote WebSocket listener.
pub async fn connect(url: &str) -> Result<TransportLink, MeshError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|err| MeshError::ConnectionRefused(format!("{url}: {err}")))?;
    debug!(url, "websocket dial succeeded");
    Ok(spawn_pumps(stream, LinkKind::WsOutbound, url.to_string()))
}

/// Accept loop for the listening side. Each accepted connection becomes a
/// link on `links`; the loop ends when the receiver side is dropped.
pub async fn serve(listener: TcpListener, links: mpsc::Sender<TransportLink>) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(addr = %local, "websocket listener up");

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let links = links.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    let link = spawn_pumps(ws, LinkKind::WsInbound, remote.to_string());
                    if links.send(link).await.is_err() {
                        debug!("listener consumer gone, dropping accepted link");
                    }
                }
                Err(err) => debug!(%remote, %err, "websocket handshake failed"),
            }
        });
    }
}

/// Bind a listener socket.
pub async fn bind(addr: &str) -> Result<TcpListener, MeshError> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| MeshError::Transport(format!("bind {addr}: {err}")))
}

fn spawn_pumps<S>(ws: WebSocketStream<S>, kind: LinkKind, remote_addr: String) -> TransportLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<String>(LINK_CHANNEL_DEPTH);

    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_addr = remote_addr.clone();
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        warn!(remote = %reader_addr, "non-UTF-8 binary frame dropped");
                    }
                },
                Ok(Message::Close(_)) => break,
                // Ping/pong and raw frames are the library's business.
                Ok(_) => {}
                Err(err) => {
                    debug!(remote = %reader_addr, %err, "websocket read error");
                    break;
                }
            }
        }
    });

    TransportLink {
        kind,
        remote_addr,
        tx: out_tx,
        rx: in_rx,
    }
}

/// Convenience wrapper: dial a raw TCP stream already accepted elsewhere.
pub async fn accept_stream(stream: TcpStream, remote_addr: String) -> Result<TransportLink, MeshError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|err| MeshError::Transport(format!("handshake with {remote_addr}: {err}")))?;
    Ok(spawn_pumps(ws, LinkKind::WsInbound, remote_addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_and_accept_exchange_frames() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (links_tx, mut links_rx) = mpsc::channel(4);
        tokio::spawn(serve(listener, links_tx));

        let client = connect(&format!("ws://{addr}")).await.unwrap();
        let mut server = links_rx.recv().await.unwrap();
        assert_eq!(server.kind, LinkKind::WsInbound);
        assert_eq!(client.kind, LinkKind::WsOutbound);

        client.tx.send("over".to_string()).await.unwrap();
        assert_eq!(server.rx.recv().await.unwrap(), "over");

        server.tx.send("back".to_string()).await.unwrap();
        let mut client = client;
        assert_eq!(client.rx.recv().await.unwrap(), "back");
    }

    #[tokio::test]
    async fn closing_the_client_ends_the_server_link() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (links_tx, mut links_rx) = mpsc::channel(4);
        tokio::spawn(serve(listener, links_tx));

        let client = connect(&format!("ws://{addr}")).await.unwrap();
        let mut server = links_rx.recv().await.unwrap();

        drop(client);
        assert!(server.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dialing_a_dead_port_is_refused() {
        let err = connect("ws://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, MeshError::ConnectionRefused(_)));
    }
}
