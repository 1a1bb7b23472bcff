use std::time::Duration;

use anyhow::bail;

use crate::rudp::command::{CMD_SIZE_MAX_HEADER, CONTROL_CHANNEL};
use crate::rudp::packet_header::{CRC_LENGTH, HEADER_UDP_PACK_LENGTH};

pub const DEFAULT_APP_ID: &str = "LoadBalancing";
pub const MAX_APP_ID_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Identifies the server side application, sent as part of the init message (at most
    ///  32 ASCII characters)
    pub app_id: String,

    /// Maximum size of a UDP packet, including packet and command headers. Payloads that do not
    ///  fit into a single packet are split into fragments.
    ///
    /// The default leaves room for IP and UDP headers plus some tunneling overhead on typical
    ///  routes.
    pub mtu: u16,

    /// number of application channels, not counting the control channel
    pub channel_count: u8,

    /// initial capacity for buffered commands per queue
    pub command_buffer_size: usize,

    /// A queue that reaches a multiple of this length raises the corresponding warning status.
    ///  Warnings are advisory, queueing continues.
    pub warning_size: usize,

    /// number of resends before the absolute timeout is taken into account
    pub sent_count_allowance: u32,
    /// number of resends with unchanged round trip timeout before it starts doubling
    pub quick_resend_attempts: u32,
    /// time after the first send of a reliable command after which the connection is considered
    ///  lost if the command still is not acknowledged
    pub disconnect_timeout: Duration,
    /// keep-alive interval for otherwise idle connections
    pub ping_interval: Duration,

    pub crc_enabled: bool,

    /// maximum number of buffered incoming unreliable commands per channel, 0 for 'no limit'
    pub limit_of_unreliable_commands: usize,

    /// size of the ring buffer for the command log, 0 disables logging
    pub command_log_size: usize,

    pub traffic_stats_enabled: bool,
}

impl PeerConfig {
    pub fn new(app_id: &str) -> PeerConfig {
        PeerConfig {
            app_id: app_id.to_string(),
            mtu: 1200,
            channel_count: 2,
            command_buffer_size: 100,
            warning_size: 100,
            sent_count_allowance: 5,
            quick_resend_attempts: 0,
            disconnect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            crc_enabled: false,
            limit_of_unreliable_commands: 0,
            command_log_size: 0,
            traffic_stats_enabled: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let min_mtu = CMD_SIZE_MAX_HEADER + HEADER_UDP_PACK_LENGTH + CRC_LENGTH + 1;
        if (self.mtu as usize) < min_mtu || self.mtu as usize > i16::MAX as usize {
            bail!("MTU must be between {} and {}, is {}", min_mtu, i16::MAX, self.mtu);
        }
        if self.channel_count == 0 || self.channel_count >= CONTROL_CHANNEL {
            bail!("channel count must be between 1 and {}, is {}", CONTROL_CHANNEL - 1, self.channel_count);
        }
        if self.warning_size == 0 {
            bail!("warning size must be positive");
        }
        if self.app_id.len() > MAX_APP_ID_LEN || !self.app_id.is_ascii() {
            bail!("app id must be at most {} ASCII characters: {:?}", MAX_APP_ID_LEN, self.app_id);
        }
        Ok(())
    }

    /// the payload that fits into a single fragment
    pub fn max_fragment_len(&self) -> usize {
        self.mtu as usize - HEADER_UDP_PACK_LENGTH - CMD_SIZE_MAX_HEADER
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig::new(DEFAULT_APP_ID)
    }
}

/// Settings of the network condition simulator
#[derive(Debug, Clone, Default)]
pub struct NetworkSimulationSettings {
    pub enabled: bool,
    pub outgoing_lag: Duration,
    pub outgoing_jitter: Duration,
    /// percentage (0..=100) of outgoing UDP packets that are dropped
    pub outgoing_loss_percentage: u8,
    pub incoming_lag: Duration,
    pub incoming_jitter: Duration,
    pub incoming_loss_percentage: u8,
}
