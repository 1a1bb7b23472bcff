use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::codec::envelope::{Envelope, OperationRequest, OperationResponse};
use crate::codec::protocol::WireCodec;
use crate::codec::type_registry::TypeRegistry;
use crate::codec::value::Value;
use crate::crypto::{derive_encryption, KeyExchange, PayloadEncryption};
use crate::peer::peer_config::PeerConfig;
use crate::peer::peer_core::{ConnectionState, PeerCore, PeerCounters};
use crate::peer::peer_events::{DeferredAction, PeerEvent, PeerEventNotifier, StatusCode};
use crate::peer::round_trip::RoundTrip;
use crate::peer::tcp_stream::TcpStreamState;
use crate::peer::traffic_stats::{TrafficStats, TrafficStatsGameLevel};
use crate::rudp::connection::RudpConnection;
use crate::rudp::packet_header::HEADER_UDP_PACK_LENGTH;
use crate::transport::{PacketHandler, SendOutcome, Transport};
use crate::util::random::RngRandom;

/// operation code of the internal key exchange operation
pub const OP_INIT_ENCRYPTION: u8 = 0;
/// operation code of the internal ping operation (stream connections only)
pub const OP_PING: u8 = 1;
/// parameter key of the public key in the key exchange
pub const PARAM_PUBLIC_KEY: u8 = 1;
pub const PARAM_CLIENT_TIME: u8 = 1;
pub const PARAM_SERVER_TIME: u8 = 2;

/// Selects how messages are carried over the transport
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FramingStrategy {
    /// commands in UDP packets with acks and resends
    Rudp,
    /// length prefixed frames on a stream, relying on the stream for ordering and reliability
    Tcp,
}

enum Framing {
    Rudp(RudpConnection),
    Tcp(TcpStreamState),
}

struct PeerState {
    core: PeerCore,
    framing: Framing,
    encryption: Option<Arc<dyn PayloadEncryption>>,
    key_exchange: Option<Arc<dyn KeyExchange>>,
}

/// The client side of a connection to a server.
///
/// The application drives the peer by calling [Peer::dispatch_incoming_commands] and
///  [Peer::send_outgoing_commands] (or [Peer::service]) regularly, and consumes [PeerEvent]s from
///  the receiver returned by [Peer::new]. Received data is parsed by the transport's receive loop,
///  but only acks are processed there: everything else is deferred and processed when the
///  application dispatches, so events are only ever produced by the application's calls.
pub struct Peer {
    framing_strategy: FramingStrategy,
    state: Mutex<PeerState>,
    transport: Arc<dyn Transport>,
    codec: WireCodec,
    notifier: PeerEventNotifier,
    action_sender: mpsc::UnboundedSender<DeferredAction>,
    action_receiver: Mutex<mpsc::UnboundedReceiver<DeferredAction>>,
}

impl Peer {
    pub fn new(config: PeerConfig, framing_strategy: FramingStrategy, transport: Arc<dyn Transport>, registry: Arc<TypeRegistry>) -> anyhow::Result<(Arc<Peer>, mpsc::UnboundedReceiver<PeerEvent>)> {
        config.validate()?;

        let (framing, package_header_size) = match framing_strategy {
            FramingStrategy::Rudp => (Framing::Rudp(RudpConnection::new(&config)), HEADER_UDP_PACK_LENGTH),
            FramingStrategy::Tcp => (Framing::Tcp(TcpStreamState::new(&config)), 0),
        };
        let (notifier, events) = PeerEventNotifier::new();
        let (action_sender, action_receiver) = mpsc::unbounded_channel();

        let peer = Peer {
            framing_strategy,
            state: Mutex::new(PeerState {
                core: PeerCore::new(config, package_header_size),
                framing,
                encryption: None,
                key_exchange: None,
            }),
            transport,
            codec: WireCodec::new(registry),
            notifier,
            action_sender,
            action_receiver: Mutex::new(action_receiver),
        };
        Ok((Arc::new(peer), events))
    }

    fn lock_state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn defer(&self, action: DeferredAction) {
        if self.action_sender.send(action).is_err() {
            debug!("action queue is closed - dropping action");
        }
    }

    /// moves everything signalled while the lock was held to the action queue
    fn forward_signals(&self, core: &mut PeerCore) {
        for action in core.take_signals() {
            self.defer(action);
        }
    }

    pub fn framing_strategy(&self) -> FramingStrategy {
        self.framing_strategy
    }

    /// Starts connecting to a server at `host:port`. Returns `false` if the peer is not
    ///  disconnected or the transport could not be connected; the latter is also reported as
    ///  [StatusCode::ExceptionOnConnect].
    pub async fn connect(self: &Arc<Self>, server_address: &str) -> bool {
        {
            let mut state = self.lock_state();
            if state.core.state != ConnectionState::Disconnected {
                warn!("connect() can only be called when disconnected, the peer is {}", state.core.state);
                return false;
            }

            let PeerState { core, framing, encryption, key_exchange } = &mut *state;
            core.reset::<RngRandom>();
            *encryption = None;
            *key_exchange = None;
            match framing {
                Framing::Rudp(connection) => {
                    connection.reset(&core.config);
                    connection.start_connect(core);
                }
                Framing::Tcp(stream) => {
                    stream.reset(&core.config);
                    stream.start_connect(core);
                }
            }
            info!("connecting to {} with challenge {:x}", server_address, core.challenge);
        }

        let handler = Arc::new(PeerPacketHandler { peer: Arc::downgrade(self) });
        if let Err(e) = self.transport.connect(server_address, handler).await {
            error!(error = ?e, "connecting to {} failed", server_address);
            self.defer(DeferredAction::Status(StatusCode::ExceptionOnConnect));
            self.defer(DeferredAction::Disconnect);
            return false;
        }

        if self.framing_strategy == FramingStrategy::Tcp {
            self.send_outgoing_commands().await;
        }
        true
    }

    /// Closes the connection, telling the server unless the connection is lost already. The
    ///  [StatusCode::Disconnect] status is delivered on the next dispatch.
    pub async fn disconnect(&self) {
        let goodbye = {
            let mut state = self.lock_state();
            let PeerState { core, framing, .. } = &mut *state;
            if matches!(core.state, ConnectionState::Disconnected | ConnectionState::Disconnecting) {
                return;
            }
            info!("disconnecting - state {}, peer id {}", core.state, core.peer_id);

            let goodbye = match framing {
                Framing::Rudp(connection) => {
                    connection.prepare_disconnect(core);
                    connection.send_pass(core, false).datagram
                }
                Framing::Tcp(_) => {
                    core.state = ConnectionState::Disconnecting;
                    None
                }
            };
            self.forward_signals(core);
            goodbye
        };

        if let Some(datagram) = goodbye {
            if self.transport.send(&datagram).await != SendOutcome::Sent {
                debug!("disconnect command could not be sent");
            }
        }
        self.transport.disconnect().await;

        let mut state = self.lock_state();
        let PeerState { core, framing, .. } = &mut *state;
        if let Framing::Tcp(stream) = framing {
            stream.clear_incoming();
        }
        core.state = ConnectionState::Disconnected;
        core.signal_status(StatusCode::Disconnect);
        self.forward_signals(core);
    }

    /// Sends everything that is due: acks, resends, a ping if the connection is idle, and queued
    ///  commands. Returns `true` if commands remain queued because they did not fit into a packet,
    ///  in which case the caller should call this again.
    pub async fn send_outgoing_commands(&self) -> bool {
        let (packets, more_pending, timed_out) = {
            let mut state = self.lock_state();
            let PeerState { core, framing, .. } = &mut *state;
            if core.traffic_stats_enabled() {
                core.traffic_stats_game_level.send_outgoing_commands_called();
            }
            if core.state == ConnectionState::Disconnected || !self.transport.is_connected() {
                return false;
            }

            let result = match framing {
                Framing::Rudp(connection) => {
                    let pass = connection.send_pass(core, false);
                    (pass.datagram.into_iter().collect::<Vec<_>>(), pass.more_pending, pass.timed_out)
                }
                Framing::Tcp(stream) => (stream.take_outgoing(core), false, false),
            };
            self.forward_signals(core);
            result
        };

        if timed_out {
            self.disconnect().await;
            return false;
        }

        for packet in packets {
            if !self.send_to_transport(&packet).await {
                return false;
            }
        }
        more_pending
    }

    /// Sends only acks (or, on a stream connection, a ping if one is due). Resends are postponed
    ///  rather than triggered, so this keeps a connection alive while the application does not
    ///  process incoming data.
    pub async fn send_acks_only(&self) -> bool {
        let (packet, more_pending) = {
            let mut state = self.lock_state();
            let PeerState { core, framing, .. } = &mut *state;
            if core.state == ConnectionState::Disconnected || !self.transport.is_connected() {
                return false;
            }

            let result = match framing {
                Framing::Rudp(connection) => {
                    let pass = connection.send_pass(core, true);
                    (pass.datagram, pass.more_pending)
                }
                Framing::Tcp(stream) => (stream.ping_if_due(core), false),
            };
            self.forward_signals(core);
            result
        };

        if let Some(packet) = packet {
            self.send_to_transport(&packet).await;
        }
        more_pending
    }

    async fn send_to_transport(&self, packet: &[u8]) -> bool {
        match self.transport.send(packet).await {
            SendOutcome::Sent => true,
            SendOutcome::Skipped => {
                debug!("transport is not connected - skipped sending {} bytes", packet.len());
                false
            }
            SendOutcome::Failed => {
                self.defer(DeferredAction::Status(StatusCode::Exception));
                self.defer(DeferredAction::Disconnect);
                false
            }
        }
    }

    /// Runs all deferred work (delivering queued status changes, executing received commands),
    ///  then dispatches at most one received message to the application. Returns `true` if a
    ///  message was dispatched, so the caller can loop until all messages are dispatched.
    pub async fn dispatch_incoming_commands(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.core.traffic_stats_enabled() {
                state.core.traffic_stats_game_level.dispatch_incoming_commands_called();
            }
        }

        self.run_deferred_actions().await;

        let message = {
            let mut state = self.lock_state();
            let PeerState { core, framing, .. } = &mut *state;
            match framing {
                Framing::Rudp(connection) => connection.dispatch_next(core).map(|payload| payload.to_vec()),
                Framing::Tcp(stream) => stream.dispatch_next(core),
            }
        };

        match message {
            Some(message) => {
                self.deserialize_message_and_callback(&message).await;
                true
            }
            None => false,
        }
    }

    /// dispatches all received messages, then sends everything that is queued
    pub async fn service(&self) {
        while self.dispatch_incoming_commands().await {}
        while self.send_outgoing_commands().await {}
    }

    async fn run_deferred_actions(&self) {
        loop {
            let action = self.action_receiver.lock()
                .unwrap_or_else(|e| e.into_inner())
                .try_recv();
            let Ok(action) = action else { break };

            match action {
                DeferredAction::Status(status) => self.notifier.send_status(status),
                DeferredAction::ExecuteCommand(command) => {
                    let mut state = self.lock_state();
                    let PeerState { core, framing, .. } = &mut *state;
                    match framing {
                        Framing::Rudp(connection) => {
                            connection.execute_command(core, command);
                        }
                        Framing::Tcp(_) => warn!("ignoring {} on a stream connection", command),
                    }
                    self.forward_signals(core);
                }
                DeferredAction::CloseTransport => self.transport.disconnect().await,
                DeferredAction::Disconnect => self.disconnect().await,
            }
        }
    }

    async fn deserialize_message_and_callback(&self, message: &[u8]) {
        let (encryption, byte_count) = {
            let state = self.lock_state();
            (state.encryption.clone(), state.core.counters.byte_count_current_dispatch)
        };

        let envelope = match self.codec.try_deser_message(message, encryption.as_deref()) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = ?e, "failed to deserialize message of {} bytes - dropping", message.len());
                return;
            }
        };

        match envelope {
            Envelope::OperationResponse(response) => {
                let operation_code = response.operation_code;
                let start = Instant::now();
                self.notifier.send_event(PeerEvent::OperationResponse(response));

                let mut state = self.lock_state();
                if state.core.traffic_stats_enabled() {
                    let stats = &mut state.core.traffic_stats_game_level;
                    stats.count_result(byte_count);
                    stats.time_for_response_callback(operation_code, start.elapsed());
                }
            }
            Envelope::Event(event) => {
                let code = event.code;
                let start = Instant::now();
                self.notifier.send_event(PeerEvent::Event(event));

                let mut state = self.lock_state();
                if state.core.traffic_stats_enabled() {
                    let stats = &mut state.core.traffic_stats_game_level;
                    stats.count_event(byte_count);
                    stats.time_for_event_callback(code, start.elapsed());
                }
            }
            Envelope::InitResponse => self.init_callback().await,
            Envelope::InternalOperationResponse(response) => match response.operation_code {
                OP_INIT_ENCRYPTION => self.on_encryption_response(&response),
                OP_PING => self.on_ping_response(&response),
                other => error!("received internal operation response for unknown operation code {}", other),
            },
            Envelope::Message(value) => self.notifier.send_event(PeerEvent::Message(value)),
            Envelope::RawMessage(bytes) => self.notifier.send_event(PeerEvent::RawMessage(bytes)),
            Envelope::Operation(_) | Envelope::InternalOperationRequest(_) => {
                error!("received unexpected {:?} message", envelope.message_type());
            }
        }
    }

    async fn init_callback(&self) {
        {
            let mut state = self.lock_state();
            if state.core.state == ConnectionState::Connecting {
                state.core.state = ConnectionState::Connected;
            }
            state.core.application_initialized = true;
            info!("connection initialized, peer id {}", state.core.peer_id);
        }
        self.fetch_server_timestamp().await;
        self.notifier.send_status(StatusCode::Connect);
    }

    fn on_encryption_response(&self, response: &OperationResponse) {
        let mut state = self.lock_state();
        let key_exchange = state.key_exchange.take();

        let server_public_key = response.get(PARAM_PUBLIC_KEY)
            .and_then(Value::as_bytes)
            .filter(|key| !key.is_empty());

        let encryption = match (response.return_code, server_public_key, key_exchange) {
            (0, Some(server_public_key), Some(key_exchange)) => derive_encryption(key_exchange.as_ref(), server_public_key),
            (0, None, _) => Err(anyhow!("server public key is missing")),
            (0, _, None) => Err(anyhow!("no key exchange in progress")),
            (return_code, _, _) => Err(anyhow!("server returned {} - {:?}", return_code, response.debug_message)),
        };

        match encryption {
            Ok(encryption) => {
                state.encryption = Some(encryption);
                info!("encryption established");
                self.notifier.send_status(StatusCode::EncryptionEstablished);
            }
            Err(e) => {
                error!(error = ?e, "establishing encryption failed");
                self.notifier.send_status(StatusCode::EncryptionFailedToEstablish);
            }
        }
    }

    fn on_ping_response(&self, response: &OperationResponse) {
        let mut state = self.lock_state();
        let PeerState { core, framing, .. } = &mut *state;
        let Framing::Tcp(stream) = framing else {
            debug!("ignoring ping response on a datagram connection");
            return;
        };

        let times = response.get(PARAM_CLIENT_TIME).and_then(Value::as_i32)
            .zip(response.get(PARAM_SERVER_TIME).and_then(Value::as_i32));
        match times {
            Some((client_sent_time, server_time)) => stream.read_ping_result(core, server_time, client_sent_time),
            None => error!("ping response without timestamps: {:?}", response.parameters),
        }
    }

    /// Serializes an operation and queues it for sending. Returns `Ok(false)` (and raises
    ///  [StatusCode::SendError]) if the peer is not connected or the channel does not exist.
    ///  Requesting encryption before it was established is an error.
    pub fn enqueue_operation(&self, request: OperationRequest, reliable: bool, channel: u8, encrypt: bool) -> anyhow::Result<bool> {
        self.enqueue_envelope(Envelope::Operation(request), reliable, channel, encrypt)
    }

    /// sends an arbitrary codec value, delivered to the receiver as a message
    pub fn send_message(&self, message: Value, reliable: bool, channel: u8, encrypt: bool) -> anyhow::Result<bool> {
        self.enqueue_envelope(Envelope::Message(message), reliable, channel, encrypt)
    }

    pub fn send_raw_message(&self, message: Vec<u8>, reliable: bool, channel: u8, encrypt: bool) -> anyhow::Result<bool> {
        self.enqueue_envelope(Envelope::RawMessage(message), reliable, channel, encrypt)
    }

    fn enqueue_envelope(&self, envelope: Envelope, reliable: bool, channel: u8, encrypt: bool) -> anyhow::Result<bool> {
        let mut state = self.lock_state();
        let PeerState { core, framing, encryption, .. } = &mut *state;

        if core.state != ConnectionState::Connected {
            error!("cannot send {:?} message while {}", envelope.message_type(), core.state);
            core.signal_status(StatusCode::SendError);
            self.forward_signals(core);
            return Ok(false);
        }
        if channel >= core.config.channel_count {
            error!("cannot send on channel {}, there are {} channels", channel, core.config.channel_count);
            core.signal_status(StatusCode::SendError);
            self.forward_signals(core);
            return Ok(false);
        }

        let encryption = match (encrypt, encryption.as_ref()) {
            (false, _) => None,
            (true, Some(encryption)) => Some(encryption.clone()),
            (true, None) => return Err(anyhow!("encryption is not established, exchange keys first")),
        };
        let message = self.codec.ser_message(&envelope, encryption.as_deref())?;

        match framing {
            Framing::Rudp(connection) => connection.enqueue_payload(core, Bytes::from(message), reliable, channel)?,
            Framing::Tcp(stream) => stream.enqueue_message(core, &message, reliable, channel),
        }
        self.forward_signals(core);
        Ok(true)
    }

    /// Starts the key exchange for payload encryption. The outcome is reported as
    ///  [StatusCode::EncryptionEstablished] or [StatusCode::EncryptionFailedToEstablish].
    pub fn establish_encryption(&self, key_exchange: Arc<dyn KeyExchange>) -> anyhow::Result<bool> {
        let request = OperationRequest::new(OP_INIT_ENCRYPTION)
            .with_parameter(PARAM_PUBLIC_KEY, key_exchange.public_key());

        let sent = self.enqueue_envelope(Envelope::InternalOperationRequest(request), true, 0, false)?;
        if sent {
            let mut state = self.lock_state();
            state.encryption = None;
            state.key_exchange = Some(key_exchange);
        }
        Ok(sent)
    }

    pub fn is_encryption_available(&self) -> bool {
        self.lock_state().encryption.is_some()
    }

    /// Requests the server's current time. Datagram connections send a dedicated command,
    ///  stream connections a ping.
    pub async fn fetch_server_timestamp(&self) {
        let ping = {
            let mut state = self.lock_state();
            let PeerState { core, framing, .. } = &mut *state;
            let ping = match framing {
                Framing::Rudp(connection) => {
                    connection.fetch_server_timestamp(core);
                    None
                }
                Framing::Tcp(stream) => {
                    if core.state == ConnectionState::Connected && core.application_initialized {
                        core.invalidate_server_time();
                        Some(stream.ping_frame(core))
                    }
                    else {
                        info!("fetching the server timestamp requires an initialized connection, the peer is {}", core.state);
                        core.signal_status(StatusCode::SendError);
                        None
                    }
                }
            };
            self.forward_signals(core);
            ping
        };

        if let Some(ping) = ping {
            self.send_to_transport(&ping).await;
        }
    }

    /// the server's clock in ms, estimated from the last server timestamp
    pub fn server_time(&self) -> Option<i32> {
        self.lock_state().core.server_time()
    }

    /// milliseconds since the current connection attempt started
    pub fn local_time(&self) -> i32 {
        self.lock_state().core.local_time()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_state().core.state
    }

    pub fn peer_id(&self) -> i16 {
        self.lock_state().core.peer_id
    }

    pub fn round_trip(&self) -> RoundTrip {
        self.lock_state().core.round_trip.clone()
    }

    pub fn counters(&self) -> PeerCounters {
        self.lock_state().core.counters.clone()
    }

    pub fn time_since_last_receive(&self) -> Option<Duration> {
        self.lock_state().core.timestamp_of_last_receive
            .map(|t| t.elapsed())
    }

    pub fn set_sending_only_acks(&self, value: bool) {
        self.lock_state().core.is_sending_only_acks = value;
    }

    pub fn queued_incoming_commands(&self) -> usize {
        match &self.lock_state().framing {
            Framing::Rudp(connection) => connection.queued_incoming_commands(),
            Framing::Tcp(stream) => stream.queued_incoming_commands(),
        }
    }

    pub fn queued_outgoing_commands(&self) -> usize {
        match &self.lock_state().framing {
            Framing::Rudp(connection) => connection.queued_outgoing_commands(),
            Framing::Tcp(stream) => stream.queued_outgoing_commands(),
        }
    }

    /// number of sent reliable commands that were not acknowledged yet
    pub fn sent_reliable_commands(&self) -> usize {
        match &self.lock_state().framing {
            Framing::Rudp(connection) => connection.sent_reliable().len(),
            Framing::Tcp(_) => 0,
        }
    }

    pub fn traffic_stats_incoming(&self) -> TrafficStats {
        self.lock_state().core.traffic_stats_incoming.clone()
    }

    pub fn traffic_stats_outgoing(&self) -> TrafficStats {
        self.lock_state().core.traffic_stats_outgoing.clone()
    }

    pub fn traffic_stats_game_level(&self) -> TrafficStatsGameLevel {
        self.lock_state().core.traffic_stats_game_level.clone()
    }

    pub fn reset_traffic_stats_maximum_counters(&self) {
        self.lock_state().core.traffic_stats_game_level.reset_maximum_counters();
    }

    /// the command log as text, empty if the log is disabled
    pub fn command_log_to_string(&self) -> String {
        let mut result = String::new();
        if self.lock_state().core.command_log.write_entries(&mut result).is_err() {
            error!("error formatting the command log");
        }
        result
    }

    fn on_packet(&self, buf: &[u8]) {
        let mut state = self.lock_state();
        let PeerState { core, framing, .. } = &mut *state;
        match framing {
            Framing::Rudp(connection) => match connection.receive_packet(core, buf) {
                Ok(commands) => {
                    for command in commands {
                        self.defer(DeferredAction::ExecuteCommand(command));
                    }
                }
                Err(e) => {
                    error!(error = ?e, "received malformed packet of {} bytes", buf.len());
                    core.signal_status(StatusCode::ExceptionOnReceive);
                    core.signal(DeferredAction::Disconnect);
                }
            },
            Framing::Tcp(stream) => stream.receive(core, buf),
        }
        self.forward_signals(core);
    }
}

/// Connects the transport's receive loop to the peer without keeping the peer alive
struct PeerPacketHandler {
    peer: Weak<Peer>,
}
impl PacketHandler for PeerPacketHandler {
    fn on_packet(&self, buf: &[u8]) {
        if let Some(peer) = self.peer.upgrade() {
            peer.on_packet(buf);
        }
    }

    fn on_transport_error(&self, status: StatusCode) {
        if let Some(peer) = self.peer.upgrade() {
            peer.defer(DeferredAction::Status(status));
            peer.defer(DeferredAction::Disconnect);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::envelope::EventData;
    use crate::crypto::MockKeyExchange;
    use crate::peer::peer_config::NetworkSimulationSettings;
    use crate::rudp::command::{Command, CommandType, CONTROL_CHANNEL};
    use crate::rudp::packet_header::PacketHeader;
    use crate::transport::network_simulator::NetworkSimulator;
    use crate::transport::tcp::TCP_PING_MARKER;
    use crate::transport::MockTransport;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use bytes::BytesMut;
    use std::future::Future;
    use tokio::runtime::Builder;
    use tokio::time;

    fn run_paused<F: Future<Output = ()>>(f: F) {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
            .block_on(f);
    }

    type HandlerSlot = Arc<Mutex<Option<Arc<dyn PacketHandler>>>>;

    /// The server side of a test connection: it sees what the peer sends, and injects data as
    ///  if it was received by the transport.
    struct FakeServer {
        handler: HandlerSlot,
        sent: mpsc::UnboundedReceiver<Vec<u8>>,
        challenge: i32,
        next_reliable_sequence: i32,
        codec: WireCodec,
    }
    impl FakeServer {
        async fn next_sent(&mut self) -> Vec<u8> {
            time::timeout(Duration::from_secs(60), self.sent.recv()).await.unwrap().unwrap()
        }

        /// the last of the packets sent so far
        fn last_sent(&mut self) -> Option<Vec<u8>> {
            let mut result = None;
            while let Ok(packet) = self.sent.try_recv() {
                result = Some(packet);
            }
            result
        }

        async fn next_packet(&mut self) -> (PacketHeader, Vec<Command>) {
            let datagram = self.next_sent().await;
            let header = PacketHeader::try_deser(&datagram).unwrap();
            let mut buf = &datagram[PacketHeader::header_len(header.has_crc())..];
            let commands = (0..header.command_count)
                .map(|_| Command::try_deser(&mut buf).unwrap())
                .collect();
            self.challenge = header.challenge;
            (header, commands)
        }

        fn handler(&self) -> Arc<dyn PacketHandler> {
            self.handler.lock().unwrap().clone().unwrap()
        }

        /// passes data to the peer, giving the network simulation (if any) time to deliver it
        async fn receive(&self, data: &[u8]) {
            self.handler().on_packet(data);
            time::sleep(Duration::from_millis(1)).await;
        }

        async fn deliver(&self, commands: &[Command]) {
            let mut buf = BytesMut::new();
            buf.resize(HEADER_UDP_PACK_LENGTH, 0);
            for command in commands {
                command.ser(&mut buf);
            }
            PacketHeader {
                peer_id: 0,
                flags: 0,
                command_count: commands.len() as u8,
                sent_time: 1000,
                challenge: self.challenge,
            }.ser(&mut buf[..HEADER_UDP_PACK_LENGTH]);
            self.receive(&buf).await;
        }

        fn reliable(&mut self, envelope: &Envelope) -> Command {
            let payload = self.codec.ser_message(envelope, None).unwrap();
            self.next_reliable_sequence += 1;
            let mut command = Command::new(CommandType::SendReliable, 0, Bytes::from(payload));
            command.reliable_sequence = self.next_reliable_sequence;
            command
        }
    }

    fn fake_transport(is_datagram: bool, connect_result: fn() -> anyhow::Result<()>) -> (MockTransport, FakeServer) {
        let (sender, sent) = mpsc::unbounded_channel();
        let handler: HandlerSlot = Default::default();

        let mut transport = MockTransport::new();
        let slot = handler.clone();
        transport.expect_connect()
            .returning(move |_, handler| {
                *slot.lock().unwrap() = Some(handler);
                connect_result()
            });
        transport.expect_send()
            .returning(move |buf| {
                sender.send(buf.to_vec()).unwrap();
                SendOutcome::Sent
            });
        transport.expect_is_connected().return_const(true);
        transport.expect_is_datagram().return_const(is_datagram);
        transport.expect_disconnect().returning(|| ());

        let server = FakeServer {
            handler,
            sent,
            challenge: 0,
            next_reliable_sequence: 0,
            codec: WireCodec::new(Arc::new(TypeRegistry::new())),
        };
        (transport, server)
    }

    fn new_peer(framing: FramingStrategy, transport: Arc<dyn Transport>) -> (Arc<Peer>, mpsc::UnboundedReceiver<PeerEvent>) {
        Peer::new(PeerConfig::default(), framing, transport, Arc::new(TypeRegistry::new())).unwrap()
    }

    fn statuses(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<StatusCode> {
        let mut result = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PeerEvent::StatusChanged(status) = event {
                result.push(status);
            }
        }
        result
    }

    /// runs the datagram handshake up to the point where the application is initialized
    async fn rudp_handshake(peer: &Arc<Peer>, server: &mut FakeServer, events: &mut mpsc::UnboundedReceiver<PeerEvent>) {
        assert!(peer.connect("127.0.0.1:5055").await);
        assert_eq!(peer.connection_state(), ConnectionState::Connecting);

        peer.send_outgoing_commands().await;
        let (header, commands) = server.next_packet().await;
        assert_eq!(commands[0].command_type, CommandType::Connect);

        let mut verify_payload = vec![0u8; 32];
        verify_payload[1] = 9;
        let mut verify = Command::new(CommandType::VerifyConnect, CONTROL_CHANNEL, Bytes::from(verify_payload));
        verify.reliable_sequence = 1;
        server.deliver(&[Command::ack(&commands[0], header.sent_time), verify]).await;

        assert!(!peer.dispatch_incoming_commands().await);
        assert_eq!(peer.connection_state(), ConnectionState::Connected);
        assert_eq!(peer.peer_id(), 9);

        peer.send_outgoing_commands().await;
        let (header, commands) = server.next_packet().await;
        assert_eq!(header.peer_id, 9);
        assert_eq!(commands[0].command_type, CommandType::Ack);
        assert_eq!(commands[1].command_type, CommandType::SendReliable);
        assert_eq!(&commands[1].payload[..2], &[0xF3, 0x00]);

        let init_response = server.reliable(&Envelope::InitResponse);
        server.deliver(&[Command::ack(&commands[1], header.sent_time), init_response]).await;
        assert!(peer.dispatch_incoming_commands().await);
        assert_eq!(statuses(events), vec![StatusCode::Connect]);
    }

    #[test]
    fn test_rudp_handshake_and_server_time() {
        run_paused(async {
            let (transport, mut server) = fake_transport(true, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Rudp, Arc::new(transport));
            rudp_handshake(&peer, &mut server, &mut events).await;

            peer.send_outgoing_commands().await;
            let (header, commands) = server.next_packet().await;
            assert_eq!(commands.len(), 2);
            assert_eq!(commands[1].command_type, CommandType::ServerTime);

            assert_eq!(peer.server_time(), None);
            server.deliver(&[Command::ack(&commands[1], header.sent_time)]).await;
            assert!(peer.server_time().is_some());
            assert_eq!(peer.sent_reliable_commands(), 0);
        });
    }

    #[test]
    fn test_operation_round_trip_with_lost_ack() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_i32_range_context();
        let mut num_calls = 0;
        ctx.expect().returning(move |_| {
            num_calls += 1;
            // the third packet from the server is the one acknowledging the operation
            if num_calls == 3 { 0 } else { 100 }
        });

        run_paused(async {
            let (transport, mut server) = fake_transport(true, || Ok(()));
            let simulator = NetworkSimulator::<MockRandom>::new(Arc::new(transport), NetworkSimulationSettings {
                enabled: true,
                incoming_loss_percentage: 50,
                ..Default::default()
            });
            let (peer, mut events) = new_peer(FramingStrategy::Rudp, Arc::new(simulator));
            rudp_handshake(&peer, &mut server, &mut events).await;

            let request = OperationRequest::new(1).with_parameter(0, "ping");
            assert!(peer.enqueue_operation(request, true, 0, false).unwrap());
            peer.send_outgoing_commands().await;

            let (header, commands) = server.next_packet().await;
            let operation = commands.iter()
                .find(|c| c.command_type == CommandType::SendReliable)
                .unwrap()
                .clone();
            assert_eq!(operation.channel, 0);
            assert_eq!(&operation.payload[..3], &[0xF3, 0x02, 0x01]);
            assert_eq!(peer.sent_reliable_commands(), 2);

            let acks = commands.iter()
                .filter(|c| c.is_reliable())
                .map(|c| Command::ack(c, header.sent_time))
                .collect::<Vec<_>>();
            server.deliver(&acks).await;
            assert_eq!(peer.sent_reliable_commands(), 2);

            time::sleep(Duration::from_secs(2)).await;
            peer.send_outgoing_commands().await;
            let (header, resent) = server.next_packet().await;
            assert!(resent.iter().any(|c| c.command_type == CommandType::SendReliable && c.reliable_sequence == operation.reliable_sequence));
            assert_eq!(peer.counters().reliable_commands_repeated, 2);

            let acks = resent.iter()
                .map(|c| Command::ack(c, header.sent_time))
                .collect::<Vec<_>>();
            server.deliver(&acks).await;
            assert_eq!(peer.sent_reliable_commands(), 0);

            let response = server.reliable(&Envelope::OperationResponse(OperationResponse {
                operation_code: 1,
                return_code: 0,
                debug_message: None,
                parameters: [(0, Value::from("ping"))].into_iter().collect(),
            }));
            server.deliver(&[response]).await;
            assert!(peer.dispatch_incoming_commands().await);

            match events.try_recv().unwrap() {
                PeerEvent::OperationResponse(response) => {
                    assert_eq!(response.operation_code, 1);
                    assert_eq!(response.return_code, 0);
                    assert_eq!(response.get(0), Some(&Value::from("ping")));
                }
                other => panic!("unexpected event {:?}", other),
            }
        });
    }

    #[test]
    fn test_timeout_disconnect() {
        run_paused(async {
            let (transport, mut server) = fake_transport(true, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Rudp, Arc::new(transport));
            rudp_handshake(&peer, &mut server, &mut events).await;

            assert!(peer.enqueue_operation(OperationRequest::new(1), true, 0, false).unwrap());
            for _ in 0..100 {
                peer.send_outgoing_commands().await;
                peer.dispatch_incoming_commands().await;
                if peer.connection_state() == ConnectionState::Disconnected {
                    break;
                }
                time::sleep(Duration::from_millis(500)).await;
            }

            assert_eq!(peer.connection_state(), ConnectionState::Disconnected);
            assert_eq!(statuses(&mut events), vec![StatusCode::TimeoutDisconnect, StatusCode::Disconnect]);

            // the last packet tells the server that the client timed out
            let last = server.last_sent().unwrap();
            let header = PacketHeader::try_deser(&last).unwrap();
            let mut buf = &last[HEADER_UDP_PACK_LENGTH..];
            let goodbye = Command::try_deser(&mut buf).unwrap();
            assert_eq!(header.command_count, 1);
            assert_eq!(goodbye.command_type, CommandType::Disconnect);
            assert_eq!(goodbye.reserved, crate::rudp::command::RESERVED_ZOMBIE);

            assert!(!peer.send_outgoing_commands().await);
        });
    }

    #[test]
    fn test_disconnect_by_server() {
        run_paused(async {
            let (transport, mut server) = fake_transport(true, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Rudp, Arc::new(transport));
            rudp_handshake(&peer, &mut server, &mut events).await;

            let mut disconnect = Command::new(CommandType::Disconnect, CONTROL_CHANNEL, Bytes::new());
            disconnect.reliable_sequence = 2;
            disconnect.reserved = 3;
            server.deliver(&[disconnect]).await;

            peer.dispatch_incoming_commands().await;
            assert_eq!(peer.connection_state(), ConnectionState::Disconnected);
            assert_eq!(statuses(&mut events), vec![StatusCode::DisconnectByServerUserLimit, StatusCode::Disconnect]);
        });
    }

    #[test]
    fn test_transport_error() {
        run_paused(async {
            let (transport, mut server) = fake_transport(true, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Rudp, Arc::new(transport));
            rudp_handshake(&peer, &mut server, &mut events).await;

            server.handler().on_transport_error(StatusCode::ExceptionOnReceive);
            peer.dispatch_incoming_commands().await;
            assert_eq!(peer.connection_state(), ConnectionState::Disconnected);
            assert_eq!(statuses(&mut events), vec![StatusCode::ExceptionOnReceive, StatusCode::Disconnect]);
        });
    }

    #[test]
    fn test_connect_failure() {
        run_paused(async {
            let (transport, _server) = fake_transport(true, || Err(anyhow!("unreachable")));
            let (peer, mut events) = new_peer(FramingStrategy::Rudp, Arc::new(transport));

            assert!(!peer.connect("127.0.0.1:5055").await);
            peer.dispatch_incoming_commands().await;
            assert_eq!(peer.connection_state(), ConnectionState::Disconnected);
            assert_eq!(statuses(&mut events), vec![StatusCode::ExceptionOnConnect, StatusCode::Disconnect]);

            // the failed attempt left the peer disconnected, so it can try again
            assert!(!peer.connect("127.0.0.1:5055").await);
            peer.dispatch_incoming_commands().await;
            assert_eq!(statuses(&mut events), vec![StatusCode::ExceptionOnConnect, StatusCode::Disconnect]);
        });
    }

    #[test]
    fn test_connect_twice() {
        run_paused(async {
            let (transport, _server) = fake_transport(true, || Ok(()));
            let (peer, _events) = new_peer(FramingStrategy::Rudp, Arc::new(transport));
            assert!(peer.connect("127.0.0.1:5055").await);
            assert!(!peer.connect("127.0.0.1:5055").await);
        });
    }

    #[test]
    fn test_send_errors() {
        run_paused(async {
            let (transport, mut server) = fake_transport(true, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Rudp, Arc::new(transport));

            assert!(!peer.enqueue_operation(OperationRequest::new(1), true, 0, false).unwrap());
            peer.dispatch_incoming_commands().await;
            assert_eq!(statuses(&mut events), vec![StatusCode::SendError]);

            rudp_handshake(&peer, &mut server, &mut events).await;
            assert!(!peer.enqueue_operation(OperationRequest::new(1), true, 2, false).unwrap());
            assert!(peer.enqueue_operation(OperationRequest::new(1), true, 0, true).is_err());
            peer.dispatch_incoming_commands().await;
            assert_eq!(statuses(&mut events), vec![StatusCode::SendError]);
        });
    }

    #[test]
    fn test_invalid_config() {
        let (transport, _server) = fake_transport(true, || Ok(()));
        let config = PeerConfig { channel_count: 0, ..PeerConfig::default() };
        assert!(Peer::new(config, FramingStrategy::Rudp, Arc::new(transport), Arc::new(TypeRegistry::new())).is_err());
    }

    /// connects a stream peer and runs the init exchange
    async fn tcp_handshake(peer: &Arc<Peer>, server: &mut FakeServer, events: &mut mpsc::UnboundedReceiver<PeerEvent>) {
        assert!(peer.connect("127.0.0.1:4530").await);
        let init = server.next_sent().await;
        assert_eq!(init.len(), 48);
        assert_eq!(&init[..7], &[0xFB, 0, 0, 0, 48, 0, 1]);

        server.receive(&[0xF3, 0x01]).await;
        assert!(peer.dispatch_incoming_commands().await);
        assert_eq!(peer.connection_state(), ConnectionState::Connected);
        assert_eq!(statuses(events), vec![StatusCode::Connect]);

        let ping = server.next_sent().await;
        assert_eq!(ping.len(), 5);
        assert_eq!(ping[0], TCP_PING_MARKER);
    }

    #[test]
    fn test_tcp_session() {
        run_paused(async {
            let (transport, mut server) = fake_transport(false, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Tcp, Arc::new(transport));
            tcp_handshake(&peer, &mut server, &mut events).await;

            time::sleep(Duration::from_millis(30)).await;
            let mut ping_result = vec![TCP_PING_MARKER];
            ping_result.extend_from_slice(&70_000i32.to_be_bytes());
            ping_result.extend_from_slice(&0i32.to_be_bytes());
            server.receive(&ping_result).await;
            assert!(peer.server_time().is_some());
            assert_eq!(peer.round_trip().last_round_trip_time, 31);

            let request = OperationRequest::new(1).with_parameter(0, "ping");
            assert!(peer.enqueue_operation(request, false, 1, false).unwrap());
            assert!(!peer.send_outgoing_commands().await);
            let frame = server.next_sent().await;
            assert_eq!(&frame[5..10], &[1, 0, 0xF3, 0x02, 0x01]);

            let event = server.codec.ser_message(&Envelope::Event(EventData {
                code: 7,
                parameters: [(1, Value::Int(2))].into_iter().collect(),
            }), None).unwrap();
            server.receive(&event).await;
            assert!(peer.dispatch_incoming_commands().await);
            assert!(!peer.dispatch_incoming_commands().await);
            match events.try_recv().unwrap() {
                PeerEvent::Event(event) => assert_eq!(event.code, 7),
                other => panic!("unexpected event {:?}", other),
            }

            peer.disconnect().await;
            peer.dispatch_incoming_commands().await;
            assert_eq!(peer.connection_state(), ConnectionState::Disconnected);
            assert_eq!(statuses(&mut events), vec![StatusCode::Disconnect]);
        });
    }

    #[test]
    fn test_encryption() {
        run_paused(async {
            let (transport, mut server) = fake_transport(false, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Tcp, Arc::new(transport));
            tcp_handshake(&peer, &mut server, &mut events).await;

            let mut key_exchange = MockKeyExchange::new();
            key_exchange.expect_public_key().return_const(vec![1u8, 2, 3]);
            key_exchange.expect_derive_shared_secret()
                .withf(|server_key| server_key == [4u8, 5, 6].as_slice())
                .returning(|_| Ok(vec![9u8; 32]));

            assert!(peer.establish_encryption(Arc::new(key_exchange)).unwrap());
            peer.send_outgoing_commands().await;
            let frame = server.next_sent().await;
            assert_eq!(&frame[7..10], &[0xF3, 0x06, 0x00]);

            let response = server.codec.ser_message(&Envelope::InternalOperationResponse(OperationResponse {
                operation_code: OP_INIT_ENCRYPTION,
                return_code: 0,
                debug_message: None,
                parameters: [(PARAM_PUBLIC_KEY, Value::from(vec![4u8, 5, 6]))].into_iter().collect(),
            }), None).unwrap();
            server.receive(&response).await;
            peer.dispatch_incoming_commands().await;
            assert_eq!(statuses(&mut events), vec![StatusCode::EncryptionEstablished]);
            assert!(peer.is_encryption_available());

            assert!(peer.enqueue_operation(OperationRequest::new(5), true, 0, true).unwrap());
            peer.send_outgoing_commands().await;
            let frame = server.next_sent().await;
            assert_eq!(&frame[7..9], &[0xF3, 0x82]);
        });
    }

    #[test]
    fn test_encryption_failure() {
        run_paused(async {
            let (transport, mut server) = fake_transport(false, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Tcp, Arc::new(transport));
            tcp_handshake(&peer, &mut server, &mut events).await;

            let mut key_exchange = MockKeyExchange::new();
            key_exchange.expect_public_key().return_const(vec![1u8, 2, 3]);
            key_exchange.expect_derive_shared_secret().never();
            assert!(peer.establish_encryption(Arc::new(key_exchange)).unwrap());

            let response = server.codec.ser_message(&Envelope::InternalOperationResponse(OperationResponse {
                operation_code: OP_INIT_ENCRYPTION,
                return_code: -1,
                debug_message: Some("denied".to_string()),
                parameters: Default::default(),
            }), None).unwrap();
            server.receive(&response).await;
            peer.dispatch_incoming_commands().await;
            assert_eq!(statuses(&mut events), vec![StatusCode::EncryptionFailedToEstablish]);
            assert!(!peer.is_encryption_available());
        });
    }

    #[test]
    fn test_messages() {
        run_paused(async {
            let (transport, mut server) = fake_transport(false, || Ok(()));
            let (peer, mut events) = new_peer(FramingStrategy::Tcp, Arc::new(transport));
            tcp_handshake(&peer, &mut server, &mut events).await;

            assert!(peer.send_message(Value::Int(17), true, 0, false).unwrap());
            assert!(peer.send_raw_message(vec![1, 2], true, 0, false).unwrap());
            peer.send_outgoing_commands().await;
            assert_eq!(&server.next_sent().await[7..9], &[0xF3, 0x08]);
            assert_eq!(&server.next_sent().await[7..9], &[0xF3, 0x09]);

            let message = server.codec.ser_message(&Envelope::Message(Value::from("hi")), None).unwrap();
            let raw = server.codec.ser_message(&Envelope::RawMessage(vec![7, 7]), None).unwrap();
            server.receive(&message).await;
            server.receive(&raw).await;
            while peer.dispatch_incoming_commands().await {}

            assert_eq!(events.try_recv().unwrap(), PeerEvent::Message(Value::from("hi")));
            assert_eq!(events.try_recv().unwrap(), PeerEvent::RawMessage(vec![7, 7]));
        });
    }

    #[test]
    fn test_command_log() {
        run_paused(async {
            let (transport, mut server) = fake_transport(true, || Ok(()));
            let config = PeerConfig { command_log_size: 10, ..PeerConfig::default() };
            let (peer, mut events) = Peer::new(config, FramingStrategy::Rudp, Arc::new(transport), Arc::new(TypeRegistry::new())).unwrap();
            rudp_handshake(&peer, &mut server, &mut events).await;

            let log = peer.command_log_to_string();
            assert!(log.contains("SND "));
            assert!(log.contains("ACK "));
            assert!(log.contains("Received Reliable Log: "));
            assert!(log.contains("READ "));
        });
    }
}
