use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::peer::peer_config::NetworkSimulationSettings;
use crate::peer::peer_events::StatusCode;
use crate::transport::{PacketHandler, SendOutcome, Transport};
use crate::util::random::Random;

enum SimulatedItem {
    Outgoing(Vec<u8>),
    Incoming(Vec<u8>),
}

struct Scheduled {
    due: Instant,
    sequence: u64,
    item: SimulatedItem,
}
impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    /// reversed to turn [BinaryHeap] into a min heap: earliest due first, FIFO for equal times
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.sequence).cmp(&(self.due, self.sequence))
    }
}

struct SimulationState<R: Random> {
    settings: NetworkSimulationSettings,
    sequence: AtomicU64,
    lost_packages_out: AtomicU32,
    lost_packages_in: AtomicU32,
    _random: PhantomData<fn() -> R>,
}
impl<R: Random> SimulationState<R> {
    fn is_lost(&self, is_datagram: bool, loss_percentage: u8) -> bool {
        is_datagram && loss_percentage > 0 && R::gen_i32_range(0..101) < loss_percentage as i32
    }

    fn delay(&self, lag: Duration, jitter: Duration) -> Duration {
        let jitter_millis = jitter.as_millis() as i32;
        let jitter_offset = if jitter_millis > 0 { R::gen_i32_range(-jitter_millis..jitter_millis) } else { 0 };
        let millis = lag.as_millis() as i64 + jitter_offset as i64;
        Duration::from_millis(millis.max(0) as u64)
    }

    fn schedule(&self, sender: &mpsc::UnboundedSender<Scheduled>, delay: Duration, item: SimulatedItem) {
        let scheduled = Scheduled {
            due: Instant::now() + delay,
            sequence: self.sequence.fetch_add(1, Ordering::AcqRel),
            item,
        };
        if sender.send(scheduled).is_err() {
            debug!("network simulation is stopped - dropping item");
        }
    }
}

/// Routes received packets through the simulation before they reach the actual handler
struct SimulatingHandler<R: Random> {
    state: Arc<SimulationState<R>>,
    is_datagram: bool,
    sender: mpsc::UnboundedSender<Scheduled>,
    handler: Arc<dyn PacketHandler>,
}
impl<R: Random> PacketHandler for SimulatingHandler<R> {
    fn on_packet(&self, buf: &[u8]) {
        let settings = &self.state.settings;
        if self.state.is_lost(self.is_datagram, settings.incoming_loss_percentage) {
            trace!("simulating loss of incoming packet");
            self.state.lost_packages_in.fetch_add(1, Ordering::AcqRel);
            return;
        }
        let delay = self.state.delay(settings.incoming_lag, settings.incoming_jitter);
        self.state.schedule(&self.sender, delay, SimulatedItem::Incoming(buf.to_vec()));
    }

    fn on_transport_error(&self, status: StatusCode) {
        self.handler.on_transport_error(status);
    }
}

/// Decorates a [Transport], simulating lag, jitter and packet loss in both directions. Delayed
///  items are executed in the order of their due time by a background task.
pub struct NetworkSimulator<R: Random> {
    inner: Arc<dyn Transport>,
    state: Arc<SimulationState<R>>,
    sender: RwLock<Option<mpsc::UnboundedSender<Scheduled>>>,
    cancel_sender: broadcast::Sender<()>,
}

impl<R: Random + 'static> NetworkSimulator<R> {
    pub fn new(inner: Arc<dyn Transport>, settings: NetworkSimulationSettings) -> NetworkSimulator<R> {
        let (cancel_sender, _) = broadcast::channel(1);
        NetworkSimulator {
            inner,
            state: Arc::new(SimulationState {
                settings,
                sequence: AtomicU64::new(0),
                lost_packages_out: AtomicU32::new(0),
                lost_packages_in: AtomicU32::new(0),
                _random: PhantomData,
            }),
            sender: RwLock::new(None),
            cancel_sender,
        }
    }

    pub fn settings(&self) -> &NetworkSimulationSettings {
        &self.state.settings
    }

    pub fn lost_packages_out(&self) -> u32 {
        self.state.lost_packages_out.load(Ordering::Acquire)
    }

    pub fn lost_packages_in(&self) -> u32 {
        self.state.lost_packages_in.load(Ordering::Acquire)
    }

    async fn run_scheduler(inner: Arc<dyn Transport>, handler: Arc<dyn PacketHandler>, mut receiver: mpsc::UnboundedReceiver<Scheduled>, mut cancel_receiver: broadcast::Receiver<()>) {
        let mut pending = BinaryHeap::new();
        loop {
            let next_due = pending.peek().map(|s: &Scheduled| s.due);
            tokio::select! {
                scheduled = receiver.recv() => {
                    match scheduled {
                        Some(scheduled) => pending.push(scheduled),
                        None => break,
                    }
                }
                _ = sleep_until(next_due) => {
                    while pending.peek().map(|s| s.due <= Instant::now()).unwrap_or(false) {
                        let Some(scheduled) = pending.pop() else { break };
                        match scheduled.item {
                            SimulatedItem::Outgoing(buf) => {
                                if inner.send(&buf).await == SendOutcome::Failed {
                                    warn!("sending delayed packet failed");
                                }
                            }
                            SimulatedItem::Incoming(buf) => handler.on_packet(&buf),
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
        trace!("network simulation terminated, dropping {} pending items", pending.len());
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

#[async_trait::async_trait]
impl<R: Random + 'static> Transport for NetworkSimulator<R> {
    async fn connect(&self, address: &str, handler: Arc<dyn PacketHandler>) -> anyhow::Result<()> {
        if !self.state.settings.enabled {
            return self.inner.connect(address, handler).await;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let simulating_handler = Arc::new(SimulatingHandler {
            state: self.state.clone(),
            is_datagram: self.inner.is_datagram(),
            sender: sender.clone(),
            handler: handler.clone(),
        });

        *self.sender.write().await = Some(sender);
        tokio::spawn(Self::run_scheduler(self.inner.clone(), handler, receiver, self.cancel_sender.subscribe()));

        self.inner.connect(address, simulating_handler).await
    }

    async fn send(&self, buf: &[u8]) -> SendOutcome {
        let sender = self.sender.read().await.clone();
        let Some(sender) = sender.filter(|_| self.state.settings.enabled) else {
            return self.inner.send(buf).await;
        };
        if !self.inner.is_connected() {
            return SendOutcome::Skipped;
        }

        let settings = &self.state.settings;
        if self.state.is_lost(self.inner.is_datagram(), settings.outgoing_loss_percentage) {
            trace!("simulating loss of outgoing packet");
            self.state.lost_packages_out.fetch_add(1, Ordering::AcqRel);
            return SendOutcome::Sent;
        }
        let delay = self.state.delay(settings.outgoing_lag, settings.outgoing_jitter);
        self.state.schedule(&sender, delay, SimulatedItem::Outgoing(buf.to_vec()));
        SendOutcome::Sent
    }

    async fn disconnect(&self) {
        if self.sender.write().await.take().is_some() {
            if let Err(err) = self.cancel_sender.send(()) {
                warn!(?err, "error canceling network simulation");
            }
        }
        self.inner.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn is_datagram(&self) -> bool {
        self.inner.is_datagram()
    }
}
