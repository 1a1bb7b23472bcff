use std::fmt::{Display, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf_ext::BufExt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandType {
    Ack = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendFragment = 8,
    ServerTime = 12,
}

/// the control channel used for connection management commands
pub const CONTROL_CHANNEL: u8 = 0xFF;

pub const FLAG_RELIABLE: u8 = 1;
pub const FLAG_UNSEQUENCED: u8 = 2;

pub const CMD_SIZE_HEADER: usize = 12;
pub const CMD_SIZE_ACK: usize = 20;
pub const CMD_SIZE_UNRELIABLE_HEADER: usize = 16;
pub const CMD_SIZE_FRAGMENT_HEADER: usize = 32;
/// budget reserved for a command header when splitting payloads into fragments
pub const CMD_SIZE_MAX_HEADER: usize = 36;
pub const CONNECT_PAYLOAD_LEN: usize = 32;

pub const RESERVED_DEFAULT: u8 = 4;
pub const RESERVED_ZOMBIE: u8 = 2;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FragmentInfo {
    /// reliable sequence number of the first fragment
    pub start_sequence: i32,
    pub fragment_count: i32,
    pub fragment_number: i32,
    pub total_length: i32,
    pub fragment_offset: i32,
}

/// The atomic transmissible unit of the RUDP protocol.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub command_type: CommandType,
    pub channel: u8,
    pub flags: u8,
    pub reserved: u8,
    pub reliable_sequence: i32,
    pub unreliable_sequence: i32,
    pub fragment: Option<FragmentInfo>,
    pub payload: Bytes,

    pub ack_received_reliable_sequence: i32,
    pub ack_received_sent_time: i32,

    // retransmission bookkeeping on the sending side
    pub sent_time: i32,
    pub sent_count: u32,
    pub round_trip_timeout: i32,
    pub timeout_time: i32,

    /// reassembly bookkeeping for the first fragment on the receiving side
    pub fragments_remaining: i32,
}

impl Command {
    pub fn new(command_type: CommandType, channel: u8, payload: Bytes) -> Command {
        let flags = match command_type {
            CommandType::Ack | CommandType::SendUnreliable => 0,
            _ => FLAG_RELIABLE,
        };

        Command {
            command_type,
            channel,
            flags,
            reserved: RESERVED_DEFAULT,
            reliable_sequence: 0,
            unreliable_sequence: 0,
            fragment: None,
            payload,
            ack_received_reliable_sequence: 0,
            ack_received_sent_time: 0,
            sent_time: 0,
            sent_count: 0,
            round_trip_timeout: 0,
            timeout_time: 0,
            fragments_remaining: 0,
        }
    }

    /// acknowledges a received reliable command
    pub fn ack(acked: &Command, server_sent_time: i32) -> Command {
        let mut result = Command::new(CommandType::Ack, acked.channel, Bytes::new());
        result.ack_received_reliable_sequence = acked.reliable_sequence;
        result.ack_received_sent_time = server_sent_time;
        result
    }

    pub fn connect(mtu: u16, channel_count: u8) -> Command {
        let mut payload = [0u8; CONNECT_PAYLOAD_LEN];
        payload[2..4].copy_from_slice(&(mtu as i16).to_be_bytes());
        payload[6] = 0x80;
        payload[11] = channel_count;
        payload[22] = 0x13;
        payload[23] = 0x88;
        payload[27] = 2;
        payload[31] = 2;
        Command::new(CommandType::Connect, CONTROL_CHANNEL, Bytes::copy_from_slice(&payload))
    }

    pub fn fragment(channel: u8, fragment: FragmentInfo, payload: Bytes) -> Command {
        let mut result = Command::new(CommandType::SendFragment, channel, payload);
        result.fragment = Some(fragment);
        result
    }

    pub fn is_reliable(&self) -> bool {
        self.flags & FLAG_RELIABLE != 0
    }

    pub fn header_size(&self) -> usize {
        header_size(self.command_type)
    }

    pub fn size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    /// the peer id assigned by the server, for a Verify-Connect command
    pub fn verify_connect_peer_id(&self) -> Option<i16> {
        if self.command_type != CommandType::VerifyConnect || self.payload.len() < 2 {
            return None;
        }
        Some(i16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.command_type.into());
        buf.put_u8(self.channel);
        buf.put_u8(self.flags);
        buf.put_u8(self.reserved);
        buf.put_i32(self.size() as i32);
        buf.put_i32(self.reliable_sequence);

        match self.command_type {
            CommandType::Ack => {
                buf.put_i32(self.ack_received_reliable_sequence);
                buf.put_i32(self.ack_received_sent_time);
            }
            CommandType::SendUnreliable => {
                buf.put_i32(self.unreliable_sequence);
            }
            CommandType::SendFragment => {
                let fragment = self.fragment.unwrap_or_default();
                buf.put_i32(fragment.start_sequence);
                buf.put_i32(fragment.fragment_count);
                buf.put_i32(fragment.fragment_number);
                buf.put_i32(fragment.total_length);
                buf.put_i32(fragment.fragment_offset);
            }
            _ => {}
        }

        buf.put_slice(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Command> {
        let raw_type = buf.try_get_byte()?;
        let command_type = CommandType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid command discriminator {}", raw_type))?;
        let channel = buf.try_get_byte()?;
        let flags = buf.try_get_byte()?;
        let reserved = buf.try_get_byte()?;
        let size = buf.try_get_i32_be()?;
        let reliable_sequence = buf.try_get_i32_be()?;

        let header_size = header_size(command_type);
        if size < header_size as i32 {
            bail!("{:?} command with invalid size {}", command_type, size);
        }

        let mut result = Command::new(command_type, channel, Bytes::new());
        result.flags = flags;
        result.reserved = reserved;
        result.reliable_sequence = reliable_sequence;

        match command_type {
            CommandType::Ack => {
                result.ack_received_reliable_sequence = buf.try_get_i32_be()?;
                result.ack_received_sent_time = buf.try_get_i32_be()?;
            }
            CommandType::SendUnreliable => {
                result.unreliable_sequence = buf.try_get_i32_be()?;
            }
            CommandType::SendFragment => {
                let fragment = FragmentInfo {
                    start_sequence: buf.try_get_i32_be()?,
                    fragment_count: buf.try_get_i32_be()?,
                    fragment_number: buf.try_get_i32_be()?,
                    total_length: buf.try_get_i32_be()?,
                    fragment_offset: buf.try_get_i32_be()?,
                };
                result.fragments_remaining = fragment.fragment_count;
                result.fragment = Some(fragment);
            }
            _ => {}
        }

        let payload_len = size as usize - header_size;
        result.payload = Bytes::from(buf.try_get_bytes(payload_len)?);
        Ok(result)
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.command_type {
            CommandType::Ack => write!(f, "Ack(channel {}, seq {}, sent time {})", self.channel, self.ack_received_reliable_sequence, self.ack_received_sent_time),
            CommandType::SendUnreliable => write!(f, "{:?}(channel {}, seq {}/{}, {} bytes)", self.command_type, self.channel, self.reliable_sequence, self.unreliable_sequence, self.payload.len()),
            _ => write!(f, "{:?}(channel {}, seq {}, {} bytes)", self.command_type, self.channel, self.reliable_sequence, self.payload.len()),
        }
    }
}

fn header_size(command_type: CommandType) -> usize {
    match command_type {
        CommandType::Ack => CMD_SIZE_ACK,
        CommandType::SendUnreliable => CMD_SIZE_UNRELIABLE_HEADER,
        CommandType::SendFragment => CMD_SIZE_FRAGMENT_HEADER,
        _ => CMD_SIZE_HEADER,
    }
}
