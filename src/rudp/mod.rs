pub mod channel;
pub mod command;
pub mod connection;
pub mod packet_header;
