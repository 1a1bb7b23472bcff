use anyhow::bail;
use bytes::BufMut;
use crc::{Crc, CRC_32_JAMCRC};

use crate::util::buf_ext::BufExt;

/// length of the UDP packet header without CRC
pub const HEADER_UDP_PACK_LENGTH: usize = 12;
pub const CRC_LENGTH: usize = 4;
/// value of the flags byte for packets that carry a CRC
pub const FLAGS_CRC: u8 = 0xCC;

const CRC_OFFSET: usize = HEADER_UDP_PACK_LENGTH;

/// reflected polynomial 0xEDB88320, initial value 0xFFFFFFFF, no final xor
const PACKET_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub peer_id: i16,
    pub flags: u8,
    pub command_count: u8,
    pub sent_time: i32,
    pub challenge: i32,
}

impl PacketHeader {
    pub fn header_len(crc_enabled: bool) -> usize {
        if crc_enabled {
            HEADER_UDP_PACK_LENGTH + CRC_LENGTH
        }
        else {
            HEADER_UDP_PACK_LENGTH
        }
    }

    pub fn has_crc(&self) -> bool {
        self.flags == FLAGS_CRC
    }

    /// Writes the header to the beginning of a packet buffer. The CRC (if any) is written
    ///  separately after the packet is complete.
    pub fn ser(&self, mut buf: &mut [u8]) {
        buf.put_i16(self.peer_id);
        buf.put_u8(self.flags);
        buf.put_u8(self.command_count);
        buf.put_i32(self.sent_time);
        buf.put_i32(self.challenge);
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<PacketHeader> {
        if buf.len() < HEADER_UDP_PACK_LENGTH {
            bail!("packet of {} bytes is shorter than the packet header", buf.len());
        }
        let header = PacketHeader {
            peer_id: buf.try_get_i16_be()?,
            flags: buf.try_get_byte()?,
            command_count: buf.try_get_byte()?,
            sent_time: buf.try_get_i32_be()?,
            challenge: buf.try_get_i32_be()?,
        };
        if header.has_crc() && buf.len() < CRC_LENGTH {
            bail!("CRC flag is set, but the packet is too short for a CRC");
        }
        Ok(header)
    }
}

pub fn calculate_crc(buf: &[u8]) -> u32 {
    PACKET_CRC.checksum(buf)
}

/// calculates the CRC over the complete packet (with a zeroed CRC field) and writes it to the
///  CRC field
pub fn write_crc(packet: &mut [u8]) {
    packet[CRC_OFFSET..CRC_OFFSET + CRC_LENGTH].fill(0);
    let crc = calculate_crc(packet);
    packet[CRC_OFFSET..CRC_OFFSET + CRC_LENGTH].copy_from_slice(&crc.to_be_bytes());
}

pub fn verify_crc(packet: &[u8]) -> bool {
    if packet.len() < CRC_OFFSET + CRC_LENGTH {
        return false;
    }
    let mut expected = [0u8; CRC_LENGTH];
    expected.copy_from_slice(&packet[CRC_OFFSET..CRC_OFFSET + CRC_LENGTH]);

    let mut zeroed = packet.to_vec();
    zeroed[CRC_OFFSET..CRC_OFFSET + CRC_LENGTH].fill(0);
    calculate_crc(&zeroed) == u32::from_be_bytes(expected)
}
