use std::collections::VecDeque;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::peer::command_log::CommandLogItem;
use crate::peer::peer_config::PeerConfig;
use crate::peer::peer_core::{init_message, ConnectionState, PeerCore};
use crate::peer::peer_events::{DeferredAction, StatusCode};
use crate::rudp::channel::Channel;
use crate::rudp::command::{Command, CommandType, FragmentInfo, CMD_SIZE_HEADER, CONTROL_CHANNEL, FLAG_RELIABLE, FLAG_UNSEQUENCED, RESERVED_ZOMBIE};
use crate::rudp::packet_header::{verify_crc, write_crc, PacketHeader, FLAGS_CRC, HEADER_UDP_PACK_LENGTH};

/// Result of a single send pass
#[derive(Debug, Default)]
pub struct SendPass {
    /// the packet to send, if there was anything to send
    pub datagram: Option<Vec<u8>>,
    /// commands remained queued because the packet was full
    pub more_pending: bool,
    /// a reliable command exceeded its resend budget, the connection must be torn down
    pub timed_out: bool,
}

/// Collects commands into a single MTU bounded packet
struct PacketBuilder {
    buf: BytesMut,
    capacity: usize,
    command_count: u8,
    sent_reliable: Vec<Command>,
}
impl PacketBuilder {
    fn new(capacity: usize, header_len: usize) -> PacketBuilder {
        let mut buf = BytesMut::with_capacity(capacity);
        buf.resize(header_len, 0);
        PacketBuilder {
            buf,
            capacity,
            command_count: 0,
            sent_reliable: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    /// Moves commands from the front of the queue into the packet until the next one does not fit.
    ///  Returns the number of commands left in the queue.
    fn pack(&mut self, queue: &mut VecDeque<Command>) -> usize {
        while let Some(size) = queue.front().map(|c| c.size()) {
            if self.buf.len() + size > self.capacity || self.command_count == u8::MAX {
                trace!("packet is full with {} commands, {} left in queue", self.command_count, queue.len());
                break;
            }
            let Some(command) = queue.pop_front() else { break };
            command.ser(&mut self.buf);
            self.command_count += 1;
            if command.is_reliable() {
                self.sent_reliable.push(command);
            }
        }
        queue.len()
    }

    fn finish(mut self, header: PacketHeader) -> Vec<u8> {
        header.ser(&mut self.buf[..HEADER_UDP_PACK_LENGTH]);
        if header.has_crc() {
            write_crc(&mut self.buf);
        }
        self.buf.to_vec()
    }
}

/// The reliable UDP layer of a connection: channels, the registry of sent reliable commands
///  awaiting their ack, pending acks, packet packing and command execution.
pub struct RudpConnection {
    /// the control channel first, then the application channels in ascending order
    channels: Vec<Channel>,
    sent_reliable: Vec<Command>,
    outgoing_acks: VecDeque<Command>,
    init_message: Vec<u8>,
    /// timestamp of the last received packet in the server's clock
    server_sent_time: i32,
}

impl RudpConnection {
    pub fn new(config: &PeerConfig) -> RudpConnection {
        RudpConnection {
            channels: Self::create_channels(config.channel_count),
            sent_reliable: Vec::with_capacity(config.command_buffer_size),
            outgoing_acks: VecDeque::with_capacity(config.command_buffer_size),
            init_message: init_message(&config.app_id),
            server_sent_time: 0,
        }
    }

    fn create_channels(channel_count: u8) -> Vec<Channel> {
        std::iter::once(CONTROL_CHANNEL)
            .chain(0..channel_count)
            .map(Channel::new)
            .collect()
    }

    pub fn reset(&mut self, config: &PeerConfig) {
        *self = RudpConnection::new(config);
    }

    pub fn channel(&self, channel_number: u8) -> Option<&Channel> {
        self.channels.iter().find(|c| c.channel_number == channel_number)
    }

    fn channel_mut(&mut self, channel_number: u8) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.channel_number == channel_number)
    }

    pub fn sent_reliable(&self) -> &[Command] {
        &self.sent_reliable
    }

    pub fn outgoing_acks_len(&self) -> usize {
        self.outgoing_acks.len()
    }

    pub fn queued_incoming_commands(&self) -> usize {
        self.channels.iter()
            .map(|c| c.incoming_reliable.len() + c.incoming_unreliable.len())
            .sum()
    }

    pub fn queued_outgoing_commands(&self) -> usize {
        self.channels.iter()
            .map(|c| c.outgoing_reliable.len() + c.outgoing_unreliable.len())
            .sum()
    }

    fn has_outgoing_reliable(&self) -> bool {
        self.channels.iter().any(|c| !c.outgoing_reliable.is_empty())
    }

    /// queues the Connect command that starts the handshake
    pub fn start_connect(&mut self, core: &mut PeerCore) {
        let connect = Command::connect(core.config.mtu, core.config.channel_count);
        if core.traffic_stats_enabled() {
            core.traffic_stats_outgoing.count_control_command(connect.size());
        }
        core.state = ConnectionState::Connecting;
        self.queue_outgoing_reliable(core, connect);
    }

    /// Drops all queued and in-flight commands and queues a Disconnect command instead
    pub fn prepare_disconnect(&mut self, core: &mut PeerCore) {
        self.outgoing_acks.clear();
        self.sent_reliable.clear();
        for channel in &mut self.channels {
            channel.clear_all();
        }

        let mut disconnect = Command::new(CommandType::Disconnect, CONTROL_CHANNEL, Bytes::new());
        if core.state != ConnectionState::Connected {
            disconnect.flags = FLAG_UNSEQUENCED;
        }
        if core.state == ConnectionState::Zombie {
            disconnect.reserved = RESERVED_ZOMBIE;
        }
        if core.traffic_stats_enabled() {
            core.traffic_stats_outgoing.count_control_command(disconnect.size());
        }
        self.queue_outgoing_reliable(core, disconnect);
    }

    pub fn fetch_server_timestamp(&mut self, core: &mut PeerCore) -> bool {
        if core.state != ConnectionState::Connected {
            info!("fetching the server timestamp was skipped, the peer is not connected but {}", core.state);
            return false;
        }
        let command = Command::new(CommandType::ServerTime, CONTROL_CHANNEL, Bytes::new());
        if core.traffic_stats_enabled() {
            core.traffic_stats_outgoing.count_control_command(command.size());
        }
        self.queue_outgoing_reliable(core, command);
        true
    }

    fn queue_outgoing_reliable(&mut self, core: &mut PeerCore, command: Command) {
        let Some(channel) = self.channel_mut(command.channel) else {
            error!("no channel {} for outgoing {}", command.channel, command);
            return;
        };
        core.check_queue_warning(channel.outgoing_reliable.len(), StatusCode::QueueOutgoingReliableWarning);
        channel.queue_outgoing_reliable(command);
    }

    fn queue_outgoing_unreliable(&mut self, core: &mut PeerCore, command: Command) {
        let Some(channel) = self.channel_mut(command.channel) else {
            error!("no channel {} for outgoing {}", command.channel, command);
            return;
        };
        core.check_queue_warning(channel.outgoing_unreliable.len(), StatusCode::QueueOutgoingUnreliableWarning);
        channel.queue_outgoing_unreliable(command);
    }

    fn queue_acknowledgement(&mut self, core: &mut PeerCore, ack: Command) {
        core.check_queue_warning(self.outgoing_acks.len(), StatusCode::QueueOutgoingAcksWarning);
        self.outgoing_acks.push_back(ack);
    }

    /// Wraps a serialized message into one or more commands on a channel. Payloads that do not fit
    ///  into a single packet are split into reliable fragments.
    pub fn enqueue_payload(&mut self, core: &mut PeerCore, payload: Bytes, reliable: bool, channel_number: u8) -> anyhow::Result<()> {
        let start_sequence = self.channel(channel_number)
            .ok_or_else(|| anyhow!("channel {} does not exist", channel_number))?
            .outgoing_reliable_sequence + 1;

        let max_fragment_len = core.config.max_fragment_len();
        core.counters.byte_count_last_operation = 0;

        if payload.len() > max_fragment_len {
            let fragment_count = payload.len().div_ceil(max_fragment_len) as i32;
            for (fragment_number, offset) in (0..payload.len()).step_by(max_fragment_len).enumerate() {
                let end = (offset + max_fragment_len).min(payload.len());
                let fragment = Command::fragment(channel_number, FragmentInfo {
                    start_sequence,
                    fragment_count,
                    fragment_number: fragment_number as i32,
                    total_length: payload.len() as i32,
                    fragment_offset: offset as i32,
                }, payload.slice(offset..end));

                let size = fragment.size();
                core.counters.byte_count_last_operation += size;
                if core.traffic_stats_enabled() {
                    core.traffic_stats_outgoing.count_fragment_op_command(size);
                    core.traffic_stats_game_level.count_operation(size);
                }
                self.queue_outgoing_reliable(core, fragment);
            }
            trace!("split {} bytes into {} fragments on channel {}", payload.len(), fragment_count, channel_number);
            return Ok(());
        }

        let command_type = if reliable { CommandType::SendReliable } else { CommandType::SendUnreliable };
        let command = Command::new(command_type, channel_number, payload);
        let size = command.size();
        core.counters.byte_count_last_operation = size;
        if core.traffic_stats_enabled() {
            if reliable {
                core.traffic_stats_outgoing.count_reliable_op_command(size);
            }
            else {
                core.traffic_stats_outgoing.count_unreliable_op_command(size);
            }
            core.traffic_stats_game_level.count_operation(size);
        }

        if reliable {
            self.queue_outgoing_reliable(core, command);
        }
        else {
            self.queue_outgoing_unreliable(core, command);
        }
        Ok(())
    }

    /// Builds the next packet: pending acks first, then (unless only acks are sent) resends,
    ///  a keep-alive ping if the connection is idle, and the channels' outgoing queues in channel
    ///  order.
    pub fn send_pass(&mut self, core: &mut PeerCore, acks_only: bool) -> SendPass {
        let mut result = SendPass::default();
        if core.state == ConnectionState::Disconnected {
            return result;
        }

        let now = core.update_time();
        let only_acks = acks_only || core.is_sending_only_acks;
        if !acks_only {
            core.time_last_send_outgoing = now;
        }

        let capacity = core.config.mtu as usize;
        let mut packet = PacketBuilder::new(capacity, PacketHeader::header_len(core.config.crc_enabled));
        let mut remaining = packet.pack(&mut self.outgoing_acks);

        if only_acks {
            self.postpone_resends(now);
        }
        else if self.requeue_unacknowledged(core) {
            result.timed_out = true;
            return result;
        }

        let ping_interval = core.config.ping_interval.as_millis() as i32;
        if !only_acks
            && core.state == ConnectionState::Connected
            && ping_interval > 0
            && self.sent_reliable.is_empty()
            && now.wrapping_sub(core.time_last_ack_receive) > ping_interval
            && !self.has_outgoing_reliable()
            && packet.len() + CMD_SIZE_HEADER < capacity
        {
            let ping = Command::new(CommandType::Ping, CONTROL_CHANNEL, Bytes::new());
            if core.traffic_stats_enabled() {
                core.traffic_stats_outgoing.count_control_command(ping.size());
            }
            self.queue_outgoing_reliable(core, ping);
        }

        if !only_acks {
            for channel in &mut self.channels {
                remaining += packet.pack(&mut channel.outgoing_reliable);
                remaining += packet.pack(&mut channel.outgoing_unreliable);
            }
        }

        for command in std::mem::take(&mut packet.sent_reliable) {
            self.queue_sent_command(core, command);
        }

        if packet.command_count == 0 {
            return result;
        }

        if core.traffic_stats_enabled() {
            core.traffic_stats_outgoing.count_packet(packet.command_count as usize);
        }
        let header = PacketHeader {
            peer_id: core.peer_id,
            flags: if core.config.crc_enabled { FLAGS_CRC } else { 0 },
            command_count: packet.command_count,
            sent_time: now,
            challenge: core.challenge,
        };
        let datagram = packet.finish(header);
        core.counters.bytes_out += datagram.len() as u64;

        result.datagram = Some(datagram);
        result.more_pending = remaining > 0;
        result
    }

    /// Moves sent commands whose round trip timeout elapsed back to their channel's outgoing queue.
    ///  Returns `true` if a command exceeded both its resend allowance and the disconnect timeout.
    fn requeue_unacknowledged(&mut self, core: &mut PeerCore) -> bool {
        let now = core.time_int;
        let is_due = |command: &Command| now.wrapping_sub(command.sent_time) > command.round_trip_timeout;

        if let Some(expired) = self.sent_reliable.iter()
            .find(|&c| is_due(c) && c.sent_count > core.config.sent_count_allowance && now > c.timeout_time)
        {
            warn!("timeout disconnect: {} was not acknowledged - now {}, challenge {:x}", expired, now, core.challenge);
            let log_item = CommandLogItem::sent_reliable(expired, now, core.round_trip.round_trip_time, core.round_trip.round_trip_time_variance, true);
            core.command_log.add(log_item);
            core.state = ConnectionState::Zombie;
            core.signal_status(StatusCode::TimeoutDisconnect);
            return true;
        }

        let (due, pending): (Vec<Command>, Vec<Command>) = std::mem::take(&mut self.sent_reliable)
            .into_iter()
            .partition(|c| is_due(c));
        self.sent_reliable = pending;

        for command in due {
            debug!("resending {} - round trip timeout {}, sent {}, now {}, rtt/var {}/{}", command, command.round_trip_timeout, command.sent_time, now,
                core.round_trip.round_trip_time, core.round_trip.round_trip_time_variance);
            core.counters.reliable_commands_repeated += 1;
            self.queue_outgoing_reliable(core, command);
        }
        false
    }

    /// Restarts the timeout of commands that are due for a resend. This keeps the connection
    ///  alive while the application only sends acks.
    fn postpone_resends(&mut self, now: i32) {
        for command in &mut self.sent_reliable {
            if command.round_trip_timeout != 0 && now.wrapping_sub(command.sent_time) > command.round_trip_timeout {
                command.sent_count = 1;
                command.round_trip_timeout = 0;
                command.timeout_time = i32::MAX;
                command.sent_time = now;
            }
        }
    }

    fn queue_sent_command(&mut self, core: &mut PeerCore, mut command: Command) {
        let now = core.time_int;
        command.sent_time = now;
        command.sent_count += 1;
        if command.round_trip_timeout == 0 {
            // 0 marks a command without timeout
            command.round_trip_timeout = core.round_trip.retransmission_timeout().max(1);
            command.timeout_time = now.wrapping_add(core.config.disconnect_timeout.as_millis() as i32);
        }
        else if command.sent_count > core.config.quick_resend_attempts + 1 {
            command.round_trip_timeout = command.round_trip_timeout.saturating_mul(2);
        }

        core.counters.reliable_commands_sent += 1;
        core.command_log.add(CommandLogItem::sent_reliable(&command, now, core.round_trip.round_trip_time, core.round_trip.round_trip_time_variance, false));

        self.sent_reliable.push(command);
        core.check_queue_warning(self.sent_reliable.len(), StatusCode::QueueSentWarning);
    }

    fn remove_sent_reliable(&mut self, reliable_sequence: i32, channel: u8) -> Option<Command> {
        let idx = self.sent_reliable.iter()
            .position(|c| c.reliable_sequence == reliable_sequence && c.channel == channel)?;
        Some(self.sent_reliable.remove(idx))
    }

    /// Parses a received packet. Acks are executed right away and reliable commands are
    ///  acknowledged; all other commands are returned for deferred execution on the pump.
    ///  Packets with a wrong CRC or challenge are dropped.
    pub fn receive_packet(&mut self, core: &mut PeerCore, data: &[u8]) -> anyhow::Result<Vec<Command>> {
        core.timestamp_of_last_receive = Some(Instant::now());

        let header = PacketHeader::try_deser(data)?;
        core.counters.bytes_in += data.len() as u64;

        if header.has_crc() && !verify_crc(data) {
            core.counters.packet_loss_by_crc += 1;
            if core.state != ConnectionState::Disconnected {
                debug!("ignoring packet with wrong CRC");
            }
            return Ok(Vec::new());
        }

        if core.traffic_stats_enabled() {
            core.traffic_stats_incoming.count_packet(header.command_count as usize);
        }
        if header.command_count == 0 || header.command_count as usize > core.config.command_buffer_size {
            warn!("too many / few commands in incoming packet: {}", header.command_count);
        }

        if header.challenge != core.challenge {
            core.counters.packet_loss_by_challenge += 1;
            if core.state != ConnectionState::Disconnected {
                debug!("ignoring packet with wrong challenge {:x} (expected {:x}) and {} commands", header.challenge, core.challenge, header.command_count);
            }
            return Ok(Vec::new());
        }

        let now = core.update_time();
        self.server_sent_time = header.sent_time;

        let mut buf = &data[PacketHeader::header_len(header.has_crc())..];
        let mut deferred = Vec::new();
        for _ in 0..header.command_count {
            let command = Command::try_deser(&mut buf)?;
            trace!("received {}", command);

            if command.command_type == CommandType::VerifyConnect && core.peer_id == -1 {
                if let Some(peer_id) = command.verify_connect_peer_id() {
                    core.peer_id = peer_id;
                }
            }

            if command.is_reliable() {
                let (rtt, variance) = (core.round_trip.round_trip_time, core.round_trip.round_trip_time_variance);
                core.command_log.add(CommandLogItem::received_reliable(&command, now, rtt, variance));

                let ack = Command::ack(&command, self.server_sent_time);
                if core.traffic_stats_enabled() {
                    core.traffic_stats_incoming.timestamp_of_last_reliable_command = now;
                    core.traffic_stats_outgoing.count_control_command(ack.size());
                }
                self.queue_acknowledgement(core, ack);
            }

            if command.command_type == CommandType::Ack {
                core.traffic_stats_incoming.timestamp_of_last_ack = now;
                self.execute_command(core, command);
            }
            else {
                deferred.push(command);
            }
        }
        Ok(deferred)
    }

    /// Executes a received command. Returns `false` if a data command was not queued.
    pub fn execute_command(&mut self, core: &mut PeerCore, command: Command) -> bool {
        let stats_enabled = core.traffic_stats_enabled();
        match command.command_type {
            CommandType::Connect | CommandType::Ping | CommandType::ServerTime => {
                if stats_enabled {
                    core.traffic_stats_incoming.count_control_command(command.size());
                }
                true
            }
            CommandType::Disconnect => {
                if stats_enabled {
                    core.traffic_stats_incoming.count_control_command(command.size());
                }
                let reason = match command.reserved {
                    1 => StatusCode::DisconnectByServerLogic,
                    3 => StatusCode::DisconnectByServerUserLimit,
                    _ => StatusCode::DisconnectByServer,
                };
                info!("server sent disconnect - peer id {}, rtt/var {}/{}, reason byte {}", core.peer_id as u16,
                    core.round_trip.round_trip_time, core.round_trip.round_trip_time_variance, command.reserved);

                core.state = ConnectionState::Disconnecting;
                core.signal_status(reason);
                core.signal(DeferredAction::CloseTransport);
                core.state = ConnectionState::Disconnected;
                core.signal_status(StatusCode::Disconnect);
                true
            }
            CommandType::Ack => {
                self.execute_ack(core, command);
                true
            }
            CommandType::SendReliable | CommandType::SendUnreliable => {
                if stats_enabled {
                    if command.command_type == CommandType::SendReliable {
                        core.traffic_stats_incoming.count_reliable_op_command(command.size());
                    }
                    else {
                        core.traffic_stats_incoming.count_unreliable_op_command(command.size());
                    }
                }
                if core.state != ConnectionState::Connected {
                    debug!("ignoring {} while {}", command, core.state);
                    return false;
                }
                self.queue_incoming(core, command)
            }
            CommandType::SendFragment => {
                if stats_enabled {
                    core.traffic_stats_incoming.count_fragment_op_command(command.size());
                }
                if core.state != ConnectionState::Connected {
                    debug!("ignoring {} while {}", command, core.state);
                    return false;
                }
                let channel_number = command.channel;
                let Some(channel) = self.channel_mut(channel_number) else {
                    error!("received command for non-existing channel {}", channel_number);
                    return false;
                };
                match channel.admit_fragment(command) {
                    Some(previous_len) => {
                        core.check_queue_warning(previous_len, StatusCode::QueueIncomingReliableWarning);
                        true
                    }
                    None => false,
                }
            }
            CommandType::VerifyConnect => {
                if stats_enabled {
                    core.traffic_stats_incoming.count_control_command(command.size());
                }
                if core.state == ConnectionState::Connecting {
                    let init = Command::new(CommandType::SendReliable, 0, Bytes::from(self.init_message.clone()));
                    if stats_enabled {
                        core.traffic_stats_outgoing.count_control_command(init.size());
                    }
                    self.queue_outgoing_reliable(core, init);
                    core.state = ConnectionState::Connected;
                    info!("connection verified, peer id {}", core.peer_id);
                }
                true
            }
        }
    }

    fn execute_ack(&mut self, core: &mut PeerCore, ack: Command) {
        if core.traffic_stats_enabled() {
            core.traffic_stats_incoming.count_control_command(ack.size());
        }
        let now = core.time_int;
        core.time_last_ack_receive = now;
        let last_round_trip_time = now.wrapping_sub(ack.ack_received_sent_time);
        core.round_trip.last_round_trip_time = last_round_trip_time;

        let removed = self.remove_sent_reliable(ack.ack_received_reliable_sequence, ack.channel);
        let (rtt, variance) = (core.round_trip.round_trip_time, core.round_trip.round_trip_time_variance);
        core.command_log.add(CommandLogItem::received_ack(&ack, now, rtt, variance));

        let Some(removed) = removed else {
            trace!("no sent command for {} while {}", ack, core.state);
            return;
        };

        match removed.command_type {
            CommandType::ServerTime => {
                if last_round_trip_time <= core.round_trip.round_trip_time {
                    core.set_server_time_offset(self.server_sent_time, last_round_trip_time);
                }
                else {
                    self.fetch_server_timestamp(core);
                }
            }
            CommandType::Disconnect if core.state == ConnectionState::Disconnecting => {
                core.round_trip.update(last_round_trip_time);
                debug!("received disconnect ack by server");
                core.signal(DeferredAction::CloseTransport);
            }
            CommandType::Connect => {
                core.round_trip.update(last_round_trip_time);
                core.round_trip.round_trip_time = last_round_trip_time;
            }
            _ => {
                core.round_trip.update(last_round_trip_time);
            }
        }
    }

    fn queue_incoming(&mut self, core: &mut PeerCore, command: Command) -> bool {
        let channel_number = command.channel;
        let Some(channel) = self.channel_mut(channel_number) else {
            error!("received command for non-existing channel {}", channel_number);
            return false;
        };

        let status = if command.flags == FLAG_RELIABLE {
            StatusCode::QueueIncomingReliableWarning
        }
        else {
            StatusCode::QueueIncomingUnreliableWarning
        };
        match channel.admit_incoming(command) {
            Some(previous_len) => {
                core.check_queue_warning(previous_len, status);
                true
            }
            None => false,
        }
    }

    /// Selects the next payload for the application, scanning the channels in order
    pub fn dispatch_next(&mut self, core: &mut PeerCore) -> Option<Bytes> {
        let limit = core.config.limit_of_unreliable_commands;
        for channel in &mut self.channels {
            if let Some(payload) = channel.next_dispatch(limit) {
                core.counters.byte_count_current_dispatch = payload.len();
                return Some(payload);
            }
        }
        None
    }
}
