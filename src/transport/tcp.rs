use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::peer::peer_events::StatusCode;
use crate::transport::{resolve_address, PacketHandler, SendOutcome, Transport};

/// every frame starts with a fixed size header: marker byte, frame length, channel, reliable flag
pub const TCP_HEADER_LEN: usize = 9;
/// offset of the message (starting at its magic byte) within a frame
pub const TCP_MESSAGE_OFFSET: usize = 7;
pub const TCP_FRAME_MARKER: u8 = 0xFB;
pub const TCP_PING_MARKER: u8 = 0xF0;
/// frames announcing more than this are treated as a corrupt stream
pub const MAX_TCP_FRAME_LEN: i32 = 8 * 1024 * 1024;

/// Reads a single frame from the stream. A ping result is returned as is (it has exactly the
///  length of a frame header), for all other frames the message starting at the magic byte is
///  returned. `None` signals that the server closed the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>> {
    let mut header = [0u8; TCP_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    if header[0] == TCP_PING_MARKER {
        return Ok(Some(header.to_vec()));
    }

    let frame_len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if frame_len < TCP_HEADER_LEN as i32 || frame_len > MAX_TCP_FRAME_LEN {
        bail!("frame with marker {:x} has invalid length {}", header[0], frame_len);
    }

    let mut frame = vec![0u8; frame_len as usize];
    frame[..TCP_HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[TCP_HEADER_LEN..]).await?;
    Ok(Some(frame.split_off(TCP_MESSAGE_OFFSET)))
}

pub struct TcpTransport {
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
    cancel_sender: broadcast::Sender<()>,
}
impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new()
    }
}
impl TcpTransport {
    pub fn new() -> TcpTransport {
        let (cancel_sender, _) = broadcast::channel(1);
        TcpTransport {
            writer: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            cancel_sender,
        }
    }

    async fn recv_loop<R: AsyncRead + Unpin>(mut reader: R, connected: Arc<AtomicBool>, mut cancel_receiver: broadcast::Receiver<()>, handler: Arc<dyn PacketHandler>) {
        trace!("starting TCP receive loop");

        loop {
            tokio::select! {
                r = read_frame(&mut reader) => {
                    match r {
                        Ok(Some(message)) => {
                            handler.on_packet(&message);
                        }
                        Ok(None) => {
                            if connected.swap(false, Ordering::AcqRel) {
                                info!("connection closed by server");
                                handler.on_transport_error(StatusCode::DisconnectByServer);
                            }
                            break;
                        }
                        Err(e) => {
                            if connected.swap(false, Ordering::AcqRel) {
                                let is_reset = e.downcast_ref::<std::io::Error>()
                                    .map(|e| e.kind() == ErrorKind::ConnectionReset)
                                    .unwrap_or(false);
                                if is_reset {
                                    info!("connection reset by server");
                                    handler.on_transport_error(StatusCode::DisconnectByServer);
                                }
                                else {
                                    error!(error = ?e, "error receiving from stream");
                                    handler.on_transport_error(StatusCode::ExceptionOnReceive);
                                }
                            }
                            break;
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        trace!("TCP receive loop terminated");
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str, handler: Arc<dyn PacketHandler>) -> anyhow::Result<()> {
        let target = resolve_address(address).await?;
        let stream = TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        info!("TCP connection to {} established", target);

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::Release);

        tokio::spawn(Self::recv_loop(reader, self.connected.clone(), self.cancel_sender.subscribe(), handler));
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> SendOutcome {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return SendOutcome::Skipped;
        };

        match writer.write_all(buf).await {
            Ok(_) => SendOutcome::Sent,
            Err(e) => {
                error!(error = ?e, "error writing to stream");
                SendOutcome::Failed
            }
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        debug!("closing TCP connection");
        if let Err(e) = writer.shutdown().await {
            debug!(error = ?e, "error shutting down stream");
        }
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_datagram(&self) -> bool {
        false
    }
}
