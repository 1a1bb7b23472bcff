use std::collections::VecDeque;
use std::fmt::{Display, Formatter, Write};

use crate::rudp::command::Command;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandLogItem {
    SentReliable {
        time: i32,
        channel: u8,
        sequence: i32,
        rtt: i32,
        variance: i32,
        sent_count: u32,
        round_trip_timeout: i32,
        timeout: i32,
        triggered_timeout: bool,
    },
    ReceivedAck {
        time: i32,
        channel: u8,
        sequence: i32,
        rtt: i32,
        variance: i32,
        received_sent_time: i32,
    },
    ReceivedReliable {
        time: i32,
        channel: u8,
        sequence: i32,
        rtt: i32,
        variance: i32,
    },
}

impl CommandLogItem {
    pub fn sent_reliable(command: &Command, time: i32, rtt: i32, variance: i32, triggered_timeout: bool) -> CommandLogItem {
        CommandLogItem::SentReliable {
            time,
            channel: command.channel,
            sequence: command.reliable_sequence,
            rtt,
            variance,
            sent_count: command.sent_count,
            round_trip_timeout: command.round_trip_timeout,
            timeout: command.timeout_time,
            triggered_timeout,
        }
    }

    pub fn received_ack(command: &Command, time: i32, rtt: i32, variance: i32) -> CommandLogItem {
        CommandLogItem::ReceivedAck {
            time,
            channel: command.channel,
            sequence: command.ack_received_reliable_sequence,
            rtt,
            variance,
            received_sent_time: command.ack_received_sent_time,
        }
    }

    pub fn received_reliable(command: &Command, time: i32, rtt: i32, variance: i32) -> CommandLogItem {
        CommandLogItem::ReceivedReliable {
            time,
            channel: command.channel,
            sequence: command.reliable_sequence,
            rtt,
            variance,
        }
    }
}

impl Display for CommandLogItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLogItem::SentReliable { time, channel, sequence, rtt, variance, sent_count, round_trip_timeout, timeout, triggered_timeout } => {
                write!(f, "SND  NOW: {:5}  CH: {:3} SQ: {:4} RTT: {:4} VAR: {:3}  Resend#: {:2} ResendIn: {} Timeout: {:5} {}",
                       time, channel, sequence, rtt, variance, sent_count, round_trip_timeout, timeout,
                       if *triggered_timeout { "< TIMEOUT" } else { "" })
            }
            CommandLogItem::ReceivedAck { time, channel, sequence, rtt, variance, received_sent_time } => {
                write!(f, "ACK  NOW: {:5}  CH: {:3} SQ: {:4} RTT: {:4} VAR: {:3}  Sent: {:5} Diff: {:4}",
                       time, channel, sequence, rtt, variance, received_sent_time, time - received_sent_time)
            }
            CommandLogItem::ReceivedReliable { time, channel, sequence, rtt, variance } => {
                write!(f, "READ NOW: {:5}  CH: {:3} SQ: {:4} RTT: {:4} VAR: {:3}", time, channel, sequence, rtt, variance)
            }
        }
    }
}

/// Two bounded logs for troubleshooting: sent reliable commands and received acks in one, received
///  reliable commands in the other. The oldest entries are discarded when a log is full.
pub struct CommandLog {
    capacity: usize,
    outgoing: VecDeque<CommandLogItem>,
    incoming_reliable: VecDeque<CommandLogItem>,
}

impl CommandLog {
    pub fn new(capacity: usize) -> CommandLog {
        CommandLog {
            capacity,
            outgoing: VecDeque::with_capacity(capacity),
            incoming_reliable: VecDeque::with_capacity(capacity),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn clear(&mut self) {
        self.outgoing.clear();
        self.incoming_reliable.clear();
    }

    pub fn add(&mut self, item: CommandLogItem) {
        if !self.is_enabled() {
            return;
        }
        let log = match item {
            CommandLogItem::ReceivedReliable { .. } => &mut self.incoming_reliable,
            _ => &mut self.outgoing,
        };
        while log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(item);
    }

    pub fn outgoing(&self) -> impl Iterator<Item = &CommandLogItem> {
        self.outgoing.iter()
    }

    pub fn incoming_reliable(&self) -> impl Iterator<Item = &CommandLogItem> {
        self.incoming_reliable.iter()
    }

    pub fn write_entries(&self, out: &mut String) -> std::fmt::Result {
        if !self.is_enabled() {
            return Ok(());
        }
        for item in &self.outgoing {
            writeln!(out, "{}", item)?;
        }
        writeln!(out, "Received Reliable Log: ")?;
        for item in &self.incoming_reliable {
            writeln!(out, "{}", item)?;
        }
        Ok(())
    }
}
