use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::peer::peer_config::PeerConfig;
use crate::peer::peer_core::{init_message, ConnectionState, PeerCore};
use crate::peer::peer_events::{is_warning_threshold, StatusCode};
use crate::transport::tcp::{TCP_FRAME_MARKER, TCP_HEADER_LEN, TCP_MESSAGE_OFFSET, TCP_PING_MARKER};
use crate::util::buf_ext::BufExt;

/// the length of a ping request: marker byte plus the client's local time
pub const TCP_PING_LEN: usize = 5;
const MSG_HEADER: u8 = 0xF3;
const MSG_HEADER_INTERNAL: u8 = 0xF4;

/// Prefixes a message with the frame header: marker, total frame length, channel and reliable flag
pub fn frame_message(message: &[u8], channel: u8, reliable: bool) -> Vec<u8> {
    let mut result = Vec::with_capacity(TCP_MESSAGE_OFFSET + message.len());
    result.push(TCP_FRAME_MARKER);
    result.extend_from_slice(&((TCP_MESSAGE_OFFSET + message.len()) as i32).to_be_bytes());
    result.push(channel);
    result.push(reliable as u8);
    result.extend_from_slice(message);
    result
}

/// The stream based framing of a connection. TCP provides ordering and reliability, so there are
///  no acks and no resends: outgoing frames are queued and flushed on every send, received
///  messages are buffered until the application dispatches them.
pub struct TcpStreamState {
    outgoing_stream: VecDeque<Vec<u8>>,
    incoming_list: VecDeque<Vec<u8>>,
    outgoing_commands_in_stream: usize,
    /// local time of the last ping, in ms
    last_ping_result: i32,
    init_frame: Vec<u8>,
}

impl TcpStreamState {
    pub fn new(config: &PeerConfig) -> TcpStreamState {
        TcpStreamState {
            outgoing_stream: VecDeque::new(),
            incoming_list: VecDeque::new(),
            outgoing_commands_in_stream: 0,
            last_ping_result: 0,
            init_frame: frame_message(&init_message(&config.app_id), 0, true),
        }
    }

    pub fn reset(&mut self, config: &PeerConfig) {
        *self = TcpStreamState::new(config);
    }

    pub fn queued_incoming_commands(&self) -> usize {
        self.incoming_list.len()
    }

    pub fn queued_outgoing_commands(&self) -> usize {
        self.outgoing_stream.len()
    }

    pub fn clear_incoming(&mut self) {
        self.incoming_list.clear();
    }

    /// queues the init frame, which is the first frame on a new connection
    pub fn start_connect(&mut self, core: &mut PeerCore) {
        core.state = ConnectionState::Connecting;
        if core.traffic_stats_enabled() {
            core.traffic_stats_outgoing.count_packet(1);
            core.traffic_stats_outgoing.count_control_command(self.init_frame.len());
        }
        self.outgoing_stream.push_back(self.init_frame.clone());
    }

    /// Wraps a serialized message (starting at its magic byte) into a frame and queues it
    pub fn enqueue_message(&mut self, core: &mut PeerCore, message: &[u8], reliable: bool, channel: u8) {
        let frame = frame_message(message, channel, reliable);
        core.counters.byte_count_last_operation = frame.len();

        self.outgoing_commands_in_stream += 1;
        if is_warning_threshold(self.outgoing_commands_in_stream, core.config.warning_size) {
            core.signal_status(StatusCode::QueueOutgoingReliableWarning);
        }

        if core.traffic_stats_enabled() {
            core.traffic_stats_outgoing.count_packet(1);
            if reliable {
                core.traffic_stats_outgoing.count_reliable_op_command(frame.len());
            }
            else {
                core.traffic_stats_outgoing.count_unreliable_op_command(frame.len());
            }
            core.traffic_stats_game_level.count_operation(frame.len());
        }
        self.outgoing_stream.push_back(frame);
    }

    /// A ping request carrying the local time. The server answers with its own time, which
    ///  updates the round trip estimate and the server time offset.
    pub fn ping_frame(&mut self, core: &mut PeerCore) -> Vec<u8> {
        let now = core.update_time();
        self.last_ping_result = now;
        core.counters.bytes_out += TCP_PING_LEN as u64;

        if core.traffic_stats_enabled() {
            core.traffic_stats_outgoing.count_packet(1);
            core.traffic_stats_outgoing.count_control_command(TCP_PING_LEN);
        }

        let mut result = Vec::with_capacity(TCP_PING_LEN);
        result.push(TCP_PING_MARKER);
        result.extend_from_slice(&now.to_be_bytes());
        result
    }

    /// a ping frame if the connection is established and the ping interval elapsed
    pub fn ping_if_due(&mut self, core: &mut PeerCore) -> Option<Vec<u8>> {
        let now = core.update_time();
        let ping_interval = core.config.ping_interval.as_millis() as i32;
        if core.state == ConnectionState::Connected && now.wrapping_sub(self.last_ping_result) > ping_interval {
            Some(self.ping_frame(core))
        }
        else {
            None
        }
    }

    /// The frames to send in this pass, in order: a ping if one is due, then all queued frames
    pub fn take_outgoing(&mut self, core: &mut PeerCore) -> Vec<Vec<u8>> {
        let mut result = Vec::with_capacity(self.outgoing_stream.len() + 1);
        result.extend(self.ping_if_due(core));
        core.time_last_send_outgoing = core.time_int;

        core.counters.bytes_out += self.outgoing_stream.iter().map(|f| f.len() as u64).sum::<u64>();
        result.extend(self.outgoing_stream.drain(..));
        self.outgoing_commands_in_stream = 0;
        result
    }

    /// Handles a frame received from the transport: either a ping result, or a message starting
    ///  at its magic byte
    pub fn receive(&mut self, core: &mut PeerCore, data: &[u8]) {
        core.timestamp_of_last_receive = Some(Instant::now());
        if core.traffic_stats_enabled() {
            core.traffic_stats_incoming.count_packet(1);
        }

        match data.first() {
            Some(&TCP_PING_MARKER) => {
                core.counters.bytes_in += data.len() as u64;
                let mut buf = &data[1..];
                match (buf.try_get_i32_be(), buf.try_get_i32_be()) {
                    (Ok(server_time), Ok(client_sent_time)) => {
                        if core.traffic_stats_enabled() {
                            core.traffic_stats_incoming.count_control_command(TCP_HEADER_LEN);
                        }
                        self.read_ping_result(core, server_time, client_sent_time);
                    }
                    _ => error!("ping result of {} bytes is too short", data.len()),
                }
            }
            Some(&MSG_HEADER) | Some(&MSG_HEADER_INTERNAL) => {
                core.counters.bytes_in += (data.len() + TCP_MESSAGE_OFFSET) as u64;
                if core.traffic_stats_enabled() {
                    core.traffic_stats_incoming.count_reliable_op_command(data.len());
                }
                self.incoming_list.push_back(data.to_vec());
                core.check_queue_warning(self.incoming_list.len(), StatusCode::QueueIncomingReliableWarning);
            }
            other => {
                error!("received message with unknown header {:?} - dropping {} bytes", other, data.len());
            }
        }
    }

    /// Updates the round trip estimate from a ping result. The first result also initializes the
    ///  server time offset.
    pub fn read_ping_result(&mut self, core: &mut PeerCore, server_time: i32, client_sent_time: i32) {
        let now = core.update_time();
        let last_round_trip_time = now.wrapping_sub(client_sent_time);
        let first_result = !core.is_server_time_available();

        if first_result {
            core.round_trip.round_trip_time = last_round_trip_time;
        }
        core.round_trip.update(last_round_trip_time);
        if first_result {
            core.set_server_time_offset(server_time, last_round_trip_time);
            info!("server time offset initialized from ping result, rtt {}", last_round_trip_time);
        }
        trace!("ping result: server time {}, rtt {}", server_time, last_round_trip_time);
    }

    pub fn dispatch_next(&mut self, core: &mut PeerCore) -> Option<Vec<u8>> {
        let message = self.incoming_list.pop_front()?;
        core.counters.byte_count_current_dispatch = message.len() + 3;
        debug!("dispatching message of {} bytes, {} remaining", message.len(), self.incoming_list.len());
        Some(message)
    }
}
