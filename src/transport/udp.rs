use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::peer::peer_events::StatusCode;
use crate::transport::{resolve_address, PacketHandler, SendOutcome, Transport};

pub struct UdpTransport {
    receive_buffer_size: usize,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    connected: Arc<AtomicBool>,
    cancel_sender: broadcast::Sender<()>,
}
impl UdpTransport {
    /// `receive_buffer_size` is the maximum size of a received datagram, usually the MTU
    pub fn new(receive_buffer_size: usize) -> UdpTransport {
        let (cancel_sender, _) = broadcast::channel(1);
        UdpTransport {
            receive_buffer_size,
            socket: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            cancel_sender,
        }
    }

    async fn recv_loop(socket: Arc<UdpSocket>, receive_buffer_size: usize, connected: Arc<AtomicBool>, mut cancel_receiver: broadcast::Receiver<()>, handler: Arc<dyn PacketHandler>) {
        let mut buf = vec![0u8; receive_buffer_size];
        trace!("starting UDP receive loop");

        loop {
            tokio::select! {
                r = socket.recv(&mut buf) => {
                    match r {
                        Ok(len) => {
                            handler.on_packet(&buf[..len]);
                        }
                        Err(e) => {
                            if connected.swap(false, Ordering::AcqRel) {
                                error!(error = ?e, "error receiving from datagram socket");
                                handler.on_transport_error(StatusCode::ExceptionOnReceive);
                            }
                            break;
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        trace!("UDP receive loop terminated");
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn connect(&self, address: &str, handler: Arc<dyn PacketHandler>) -> anyhow::Result<()> {
        let target = resolve_address(address).await?;
        let local_addr: SocketAddr = if target.is_ipv4() { "0.0.0.0:0".parse()? } else { "[::]:0".parse()? };

        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(target).await?;
        let socket = Arc::new(socket);
        info!("UDP socket connected to {} from {:?}", target, socket.local_addr());

        *self.socket.write().await = Some(socket.clone());
        self.connected.store(true, Ordering::Release);

        tokio::spawn(Self::recv_loop(socket, self.receive_buffer_size, self.connected.clone(), self.cancel_sender.subscribe(), handler));
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> SendOutcome {
        let Some(socket) = self.socket.read().await.clone() else {
            return SendOutcome::Skipped;
        };

        match socket.send(buf).await {
            Ok(_) => SendOutcome::Sent,
            Err(e) => {
                error!(error = ?e, "error sending datagram");
                SendOutcome::Failed
            }
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if self.socket.write().await.take().is_none() {
            return;
        }
        debug!("closing UDP socket");
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_datagram(&self) -> bool {
        true
    }
}
