pub mod command_log;
pub mod peer;
pub mod peer_config;
pub mod peer_core;
pub mod peer_events;
pub mod round_trip;
pub mod tcp_stream;
pub mod traffic_stats;
