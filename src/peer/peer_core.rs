use std::fmt::{Display, Formatter};

use tokio::time::Instant;
use tracing::debug;

use crate::peer::command_log::CommandLog;
use crate::peer::peer_config::{PeerConfig, MAX_APP_ID_LEN};
use crate::peer::peer_events::{is_warning_threshold, DeferredAction, StatusCode};
use crate::peer::round_trip::RoundTrip;
use crate::peer::traffic_stats::{TrafficStats, TrafficStatsGameLevel};
use crate::util::random::{new_challenge, Random};

/// prefix of the init message, followed by the zero padded app id
const INIT_PREFIX: [u8; 9] = [0xF3, 0x00, 0x01, 0x06, 0x01, 0x04, 0x00, 0x05, 0x07];
pub const INIT_MESSAGE_LEN: usize = INIT_PREFIX.len() + MAX_APP_ID_LEN;

/// The init message that identifies the server side application
pub fn init_message(app_id: &str) -> Vec<u8> {
    let mut result = INIT_PREFIX.to_vec();
    let app_id = app_id.as_bytes();
    result.extend((0..MAX_APP_ID_LEN).map(|i| app_id.get(i).copied().unwrap_or(0)));
    result
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    AcknowledgingDisconnect,
    /// fatal timeout, the connection is being torn down
    Zombie,
}
impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packet_loss_by_crc: u32,
    pub packet_loss_by_challenge: u32,
    pub reliable_commands_sent: u32,
    pub reliable_commands_repeated: u32,
    /// size of the commands created by the last enqueued operation
    pub byte_count_last_operation: usize,
    /// size of the command currently being dispatched
    pub byte_count_current_dispatch: usize,
}

/// Connection state that is independent of the framing: lifecycle, clock, round trip estimate,
///  diagnostics, and the signals raised while the peer's lock is held.
pub struct PeerCore {
    pub config: PeerConfig,
    pub state: ConnectionState,
    pub peer_id: i16,
    pub challenge: i32,

    time_base: Instant,
    /// logical clock: milliseconds since the connection attempt started
    pub time_int: i32,
    pub time_last_ack_receive: i32,
    pub time_last_send_outgoing: i32,
    pub timestamp_of_last_receive: Option<Instant>,

    pub round_trip: RoundTrip,
    server_time_offset: Option<i32>,

    pub counters: PeerCounters,
    pub traffic_stats_incoming: TrafficStats,
    pub traffic_stats_outgoing: TrafficStats,
    pub traffic_stats_game_level: TrafficStatsGameLevel,
    pub command_log: CommandLog,

    pub is_sending_only_acks: bool,
    pub application_initialized: bool,

    signals: Vec<DeferredAction>,
}

impl PeerCore {
    pub fn new(config: PeerConfig, package_header_size: usize) -> PeerCore {
        let command_log = CommandLog::new(config.command_log_size);
        PeerCore {
            config,
            state: ConnectionState::Disconnected,
            peer_id: -1,
            challenge: 0,
            time_base: Instant::now(),
            time_int: 0,
            time_last_ack_receive: 0,
            time_last_send_outgoing: 0,
            timestamp_of_last_receive: None,
            round_trip: RoundTrip::new(),
            server_time_offset: None,
            counters: Default::default(),
            traffic_stats_incoming: TrafficStats::new(package_header_size),
            traffic_stats_outgoing: TrafficStats::new(package_header_size),
            traffic_stats_game_level: Default::default(),
            command_log,
            is_sending_only_acks: false,
            application_initialized: false,
            signals: Vec::new(),
        }
    }

    /// resets all per-connection state for a new connection attempt
    pub fn reset<R: Random>(&mut self) {
        let package_header_size = self.traffic_stats_outgoing.package_header_size;

        self.state = ConnectionState::Disconnected;
        self.peer_id = -1;
        self.challenge = new_challenge::<R>();
        self.time_base = Instant::now();
        self.time_int = 0;
        self.time_last_ack_receive = 0;
        self.time_last_send_outgoing = 0;
        self.timestamp_of_last_receive = None;
        self.round_trip.reset();
        self.server_time_offset = None;
        self.counters = Default::default();
        self.traffic_stats_incoming = TrafficStats::new(package_header_size);
        self.traffic_stats_outgoing = TrafficStats::new(package_header_size);
        self.traffic_stats_game_level = Default::default();
        self.command_log = CommandLog::new(self.config.command_log_size);
        self.application_initialized = false;
        self.signals.clear();

        debug!("reset peer state, challenge {:x}", self.challenge);
    }

    /// milliseconds since the connection attempt started
    pub fn local_time(&self) -> i32 {
        (Instant::now() - self.time_base).as_millis() as i32
    }

    pub fn update_time(&mut self) -> i32 {
        self.time_int = self.local_time();
        self.time_int
    }

    pub fn traffic_stats_enabled(&self) -> bool {
        self.config.traffic_stats_enabled
    }

    pub fn set_server_time_offset(&mut self, server_time: i32, last_round_trip_time: i32) {
        let offset = server_time
            .wrapping_add(last_round_trip_time >> 1)
            .wrapping_sub(self.local_time());
        self.server_time_offset = Some(offset);
    }

    pub fn is_server_time_available(&self) -> bool {
        self.server_time_offset.is_some()
    }

    pub fn invalidate_server_time(&mut self) {
        self.server_time_offset = None;
    }

    /// the server's clock as estimated locally, if a server timestamp was received
    pub fn server_time(&self) -> Option<i32> {
        self.server_time_offset
            .map(|offset| self.local_time().wrapping_add(offset))
    }

    pub fn signal(&mut self, action: DeferredAction) {
        self.signals.push(action);
    }

    pub fn signal_status(&mut self, status: StatusCode) {
        self.signal(DeferredAction::Status(status));
    }

    /// raises `status` if a queue of length `len` reached a warning threshold
    pub fn check_queue_warning(&mut self, len: usize, status: StatusCode) {
        if is_warning_threshold(len, self.config.warning_size) {
            self.signal_status(status);
        }
    }

    pub fn take_signals(&mut self) -> Vec<DeferredAction> {
        std::mem::take(&mut self.signals)
    }
}
