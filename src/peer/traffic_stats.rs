use std::fmt::{Display, Formatter};
use std::time::Duration;

use tokio::time::Instant;

/// Command level traffic statistics for one direction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrafficStats {
    /// per-packet overhead, used for the total byte count
    pub package_header_size: usize,

    pub reliable_command_count: u32,
    pub reliable_command_bytes: u64,
    pub unreliable_command_count: u32,
    pub unreliable_command_bytes: u64,
    pub fragment_command_count: u32,
    pub fragment_command_bytes: u64,
    pub control_command_count: u32,
    pub control_command_bytes: u64,

    pub total_packet_count: u32,
    pub total_commands_in_packets: u32,

    /// logical peer time (ms) of the last received ack
    pub timestamp_of_last_ack: i32,
    /// logical peer time (ms) of the last received reliable command
    pub timestamp_of_last_reliable_command: i32,
}

impl TrafficStats {
    pub fn new(package_header_size: usize) -> TrafficStats {
        TrafficStats {
            package_header_size,
            ..Default::default()
        }
    }

    pub fn count_reliable_op_command(&mut self, size: usize) {
        self.reliable_command_count += 1;
        self.reliable_command_bytes += size as u64;
    }

    pub fn count_unreliable_op_command(&mut self, size: usize) {
        self.unreliable_command_count += 1;
        self.unreliable_command_bytes += size as u64;
    }

    pub fn count_fragment_op_command(&mut self, size: usize) {
        self.fragment_command_count += 1;
        self.fragment_command_bytes += size as u64;
    }

    pub fn count_control_command(&mut self, size: usize) {
        self.control_command_count += 1;
        self.control_command_bytes += size as u64;
    }

    pub fn count_packet(&mut self, num_commands: usize) {
        self.total_packet_count += 1;
        self.total_commands_in_packets += num_commands as u32;
    }

    pub fn total_command_count(&self) -> u32 {
        self.reliable_command_count + self.unreliable_command_count + self.fragment_command_count + self.control_command_count
    }

    pub fn total_command_bytes(&self) -> u64 {
        self.reliable_command_bytes + self.unreliable_command_bytes + self.fragment_command_bytes + self.control_command_bytes
    }

    pub fn total_packet_bytes(&self) -> u64 {
        self.total_command_bytes() + self.total_packet_count as u64 * self.package_header_size as u64
    }
}

impl Display for TrafficStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "total packets: {} ({} bytes), commands: {} ({} bytes), reliable: {}, unreliable: {}, fragments: {}, control: {}",
               self.total_packet_count, self.total_packet_bytes(),
               self.total_command_count(), self.total_command_bytes(),
               self.reliable_command_count, self.unreliable_command_count,
               self.fragment_command_count, self.control_command_count)
    }
}


/// Message level statistics: operations, results and events, plus the pacing of the application's
///  calls into the peer
#[derive(Clone, Debug, Default)]
pub struct TrafficStatsGameLevel {
    pub operation_byte_count: u64,
    pub operation_count: u32,
    pub result_byte_count: u64,
    pub result_count: u32,
    pub event_byte_count: u64,
    pub event_count: u32,

    pub longest_op_response_callback: Duration,
    pub longest_op_response_callback_op_code: u8,
    pub longest_event_callback: Duration,
    pub longest_event_callback_code: u8,

    pub longest_delta_between_dispatching: Duration,
    pub longest_delta_between_sending: Duration,
    pub dispatch_incoming_commands_calls: u32,
    pub send_outgoing_commands_calls: u32,

    time_of_last_dispatch_call: Option<Instant>,
    time_of_last_send_call: Option<Instant>,
}

impl TrafficStatsGameLevel {
    pub fn count_operation(&mut self, bytes: usize) {
        self.operation_byte_count += bytes as u64;
        self.operation_count += 1;
    }

    pub fn count_result(&mut self, bytes: usize) {
        self.result_byte_count += bytes as u64;
        self.result_count += 1;
    }

    pub fn count_event(&mut self, bytes: usize) {
        self.event_byte_count += bytes as u64;
        self.event_count += 1;
    }

    pub fn time_for_response_callback(&mut self, op_code: u8, time: Duration) {
        if time > self.longest_op_response_callback {
            self.longest_op_response_callback = time;
            self.longest_op_response_callback_op_code = op_code;
        }
    }

    pub fn time_for_event_callback(&mut self, code: u8, time: Duration) {
        if time > self.longest_event_callback {
            self.longest_event_callback = time;
            self.longest_event_callback_code = code;
        }
    }

    pub fn dispatch_incoming_commands_called(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.time_of_last_dispatch_call {
            self.longest_delta_between_dispatching = self.longest_delta_between_dispatching.max(now - prev);
        }
        self.dispatch_incoming_commands_calls += 1;
        self.time_of_last_dispatch_call = Some(now);
    }

    pub fn send_outgoing_commands_called(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.time_of_last_send_call {
            self.longest_delta_between_sending = self.longest_delta_between_sending.max(now - prev);
        }
        self.send_outgoing_commands_calls += 1;
        self.time_of_last_send_call = Some(now);
    }

    pub fn reset_maximum_counters(&mut self) {
        self.longest_delta_between_dispatching = Duration::ZERO;
        self.longest_delta_between_sending = Duration::ZERO;
        self.longest_event_callback = Duration::ZERO;
        self.longest_event_callback_code = 0;
        self.longest_op_response_callback = Duration::ZERO;
        self.longest_op_response_callback_op_code = 0;
        self.time_of_last_dispatch_call = None;
        self.time_of_last_send_call = None;
    }

    pub fn total_byte_count(&self) -> u64 {
        self.operation_byte_count + self.result_byte_count + self.event_byte_count
    }

    pub fn total_message_count(&self) -> u32 {
        self.operation_count + self.result_count + self.event_count
    }

    pub fn vital_stats(&self) -> String {
        format!("longest delta between send: {:?} dispatch: {:?}, longest callback event {}: {:?} response {}: {:?}, calls of send: {} dispatch: {}",
                self.longest_delta_between_sending, self.longest_delta_between_dispatching,
                self.longest_event_callback_code, self.longest_event_callback,
                self.longest_op_response_callback_op_code, self.longest_op_response_callback,
                self.send_outgoing_commands_calls, self.dispatch_incoming_commands_calls)
    }
}
