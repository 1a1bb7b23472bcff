use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::rudp::command::{Command, CommandType, FragmentInfo, FLAG_RELIABLE};

/// An independent ordering domain: sequence counters plus the four command queues.
pub struct Channel {
    pub channel_number: u8,
    pub outgoing_reliable_sequence: i32,
    pub outgoing_unreliable_sequence: i32,
    /// the last dispatched reliable sequence number
    pub incoming_reliable_sequence: i32,
    /// the last dispatched unreliable sequence number
    pub incoming_unreliable_sequence: i32,
    pub outgoing_reliable: VecDeque<Command>,
    pub outgoing_unreliable: VecDeque<Command>,
    /// buffered reliable commands (including fragments) by reliable sequence number
    pub incoming_reliable: BTreeMap<i32, Command>,
    /// buffered unreliable commands by unreliable sequence number
    pub incoming_unreliable: BTreeMap<i32, Command>,
}

impl Channel {
    pub fn new(channel_number: u8) -> Channel {
        Channel {
            channel_number,
            outgoing_reliable_sequence: 0,
            outgoing_unreliable_sequence: 0,
            incoming_reliable_sequence: 0,
            incoming_unreliable_sequence: 0,
            outgoing_reliable: Default::default(),
            outgoing_unreliable: Default::default(),
            incoming_reliable: Default::default(),
            incoming_unreliable: Default::default(),
        }
    }

    pub fn clear_all(&mut self) {
        self.outgoing_reliable.clear();
        self.outgoing_unreliable.clear();
        self.incoming_reliable.clear();
        self.incoming_unreliable.clear();
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing_reliable.is_empty() || !self.outgoing_unreliable.is_empty()
    }

    /// assigns the next reliable sequence number unless the command has one already
    pub fn queue_outgoing_reliable(&mut self, mut command: Command) {
        if command.reliable_sequence == 0 {
            self.outgoing_reliable_sequence += 1;
            command.reliable_sequence = self.outgoing_reliable_sequence;
        }
        self.outgoing_reliable.push_back(command);
    }

    pub fn queue_outgoing_unreliable(&mut self, mut command: Command) {
        command.reliable_sequence = self.outgoing_reliable_sequence;
        self.outgoing_unreliable_sequence += 1;
        command.unreliable_sequence = self.outgoing_unreliable_sequence;
        self.outgoing_unreliable.push_back(command);
    }

    /// Buffers an incoming command unless it is stale or a duplicate. Returns the length of the
    ///  queue before insertion if the command was queued.
    pub fn admit_incoming(&mut self, command: Command) -> Option<usize> {
        if command.flags == FLAG_RELIABLE {
            if command.reliable_sequence <= self.incoming_reliable_sequence {
                debug!("channel {}: reliable command {} was dispatched already - dropping", self.channel_number, command.reliable_sequence);
                return None;
            }
            if self.incoming_reliable.contains_key(&command.reliable_sequence) {
                debug!("channel {}: reliable command {} is queued already - dropping", self.channel_number, command.reliable_sequence);
                return None;
            }
            let previous_len = self.incoming_reliable.len();
            self.incoming_reliable.insert(command.reliable_sequence, command);
            return Some(previous_len);
        }

        if command.flags == 0 {
            // NB: a companion reliable sequence *equal* to the dispatched one is admitted
            if command.reliable_sequence < self.incoming_reliable_sequence {
                trace!("channel {}: unreliable command {} refers to an outdated reliable sequence - dropping", self.channel_number, command.unreliable_sequence);
                return None;
            }
            if command.unreliable_sequence <= self.incoming_unreliable_sequence {
                trace!("channel {}: unreliable command {} is outdated - dropping", self.channel_number, command.unreliable_sequence);
                return None;
            }
            if self.incoming_unreliable.contains_key(&command.unreliable_sequence) {
                trace!("channel {}: unreliable command {} is queued already - dropping", self.channel_number, command.unreliable_sequence);
                return None;
            }
            let previous_len = self.incoming_unreliable.len();
            self.incoming_unreliable.insert(command.unreliable_sequence, command);
            return Some(previous_len);
        }

        warn!("channel {}: unexpected flags {} for incoming {}", self.channel_number, command.flags, command);
        None
    }

    /// Buffers a fragment and updates the 'remaining fragments' bookkeeping of its first fragment.
    ///  Returns the length of the queue before insertion if the fragment was queued.
    pub fn admit_fragment(&mut self, command: Command) -> Option<usize> {
        let Some(fragment) = command.fragment else {
            warn!("channel {}: fragment command without fragment header", self.channel_number);
            return None;
        };

        let payload_len = command.payload.len() as i64;
        let sequence = command.reliable_sequence;
        let in_fragment_range = match fragment.start_sequence.checked_add(fragment.fragment_count) {
            Some(end_sequence) => (fragment.start_sequence .. end_sequence).contains(&sequence),
            None => false,
        };
        if fragment.fragment_count <= 0
            || fragment.fragment_count > fragment.total_length
            || fragment.fragment_number > fragment.fragment_count
            || fragment.fragment_offset < 0
            || fragment.fragment_offset >= fragment.total_length
            || fragment.fragment_offset as i64 + payload_len > fragment.total_length as i64
            || !in_fragment_range
        {
            warn!("channel {}: invalid fragment {:?} with {} bytes - dropping", self.channel_number, fragment, payload_len);
            return None;
        }

        if fragment.start_sequence <= self.incoming_reliable_sequence {
            debug!("channel {}: fragment {} belongs to a dispatched message - dropping", self.channel_number, sequence);
            return None;
        }
        if sequence != fragment.start_sequence {
            if let Some(head) = self.incoming_reliable.get(&fragment.start_sequence).and_then(|c| c.fragment) {
                if !Self::is_same_message(&head, &fragment) {
                    warn!("channel {}: fragment {:?} does not match its first fragment {:?} - dropping", self.channel_number, fragment, head);
                    return None;
                }
            }
        }

        let previous_len = self.admit_incoming(command)?;

        if sequence == fragment.start_sequence {
            let already_present = self.incoming_reliable
                .range(fragment.start_sequence + 1 .. fragment.start_sequence + fragment.fragment_count)
                .count() as i32;
            if let Some(start) = self.incoming_reliable.get_mut(&sequence) {
                start.fragments_remaining -= 1 + already_present;
            }
        }
        else if let Some(start) = self.incoming_reliable.get_mut(&fragment.start_sequence) {
            start.fragments_remaining -= 1;
        }

        Some(previous_len)
    }

    fn is_same_message(a: &FragmentInfo, b: &FragmentInfo) -> bool {
        a.start_sequence == b.start_sequence && a.fragment_count == b.fragment_count && a.total_length == b.total_length
    }

    /// Selects at most one payload for dispatch to the application: the lowest eligible
    ///  unreliable command, or else the next reliable command in sequence (reassembling fragments
    ///  if necessary).
    pub fn next_dispatch(&mut self, limit_of_unreliable_commands: usize) -> Option<Bytes> {
        if let Some(payload) = self.next_unreliable(limit_of_unreliable_commands) {
            return Some(payload);
        }
        self.next_reliable()
    }

    fn next_unreliable(&mut self, limit_of_unreliable_commands: usize) -> Option<Bytes> {
        if self.incoming_unreliable.is_empty() {
            return None;
        }

        let keys = self.incoming_unreliable.keys().copied().collect::<Vec<_>>();
        let mut selected = None;
        for key in keys {
            let Some(reliable_sequence) = self.incoming_unreliable.get(&key).map(|c| c.reliable_sequence) else { continue };

            if key < self.incoming_unreliable_sequence
                || reliable_sequence < self.incoming_reliable_sequence
                || (limit_of_unreliable_commands > 0 && self.incoming_unreliable.len() > limit_of_unreliable_commands)
            {
                self.incoming_unreliable.remove(&key);
                continue;
            }

            if reliable_sequence <= self.incoming_reliable_sequence {
                selected = Some(key);
                break;
            }
        }

        let key = selected?;
        let command = self.incoming_unreliable.remove(&key)?;
        self.incoming_unreliable_sequence = key;
        Some(command.payload)
    }

    fn next_reliable(&mut self) -> Option<Bytes> {
        let next_sequence = self.incoming_reliable_sequence + 1;
        let next = self.incoming_reliable.get(&next_sequence)?;
        let (is_fragment, fragments_remaining, fragment) = (next.command_type == CommandType::SendFragment, next.fragments_remaining, next.fragment);

        if !is_fragment {
            let command = self.incoming_reliable.remove(&next_sequence)?;
            self.incoming_reliable_sequence = next_sequence;
            return Some(command.payload);
        }

        if fragments_remaining > 0 {
            return None;
        }

        let fragment = fragment?;
        let end_sequence = fragment.start_sequence.checked_add(fragment.fragment_count)?;
        let sequences = self.incoming_reliable
            .range(fragment.start_sequence .. end_sequence)
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();
        let parts = sequences.iter()
            .filter_map(|seq| self.incoming_reliable.remove(seq))
            .collect::<Vec<_>>();
        self.incoming_reliable_sequence = end_sequence - 1;

        let Some(assembled) = Self::reassemble(&fragment, &parts) else {
            warn!("channel {}: inconsistent fragments starting at {} - dropping message", self.channel_number, fragment.start_sequence);
            return None;
        };
        trace!("channel {}: reassembled {} fragments into {} bytes", self.channel_number, fragment.fragment_count, fragment.total_length);
        Some(assembled)
    }

    /// copies the parts of a fragmented message to their offsets, `None` if they do not add up
    ///  to the message described by the first fragment
    fn reassemble(head: &FragmentInfo, parts: &[Command]) -> Option<Bytes> {
        if parts.len() != head.fragment_count as usize {
            return None;
        }
        let received_len = parts.iter().map(|p| p.payload.len()).sum::<usize>();
        if received_len != head.total_length as usize {
            return None;
        }

        let mut assembled = BytesMut::zeroed(received_len);
        for part in parts {
            let info = part.fragment?;
            if !Self::is_same_message(head, &info) {
                return None;
            }
            let offset = usize::try_from(info.fragment_offset).ok()?;
            assembled.get_mut(offset .. offset + part.payload.len())?
                .copy_from_slice(&part.payload);
        }
        Some(assembled.freeze())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn reliable(seq: i32) -> Command {
        let mut result = Command::new(CommandType::SendReliable, 0, Bytes::from(vec![seq as u8]));
        result.reliable_sequence = seq;
        result
    }

    fn unreliable(reliable_seq: i32, unreliable_seq: i32) -> Command {
        let mut result = Command::new(CommandType::SendUnreliable, 0, Bytes::from(vec![100 + unreliable_seq as u8]));
        result.reliable_sequence = reliable_seq;
        result.unreliable_sequence = unreliable_seq;
        result
    }

    fn fragments(payload: &[u8], fragment_len: usize, start_sequence: i32) -> Vec<Command> {
        let fragment_count = payload.len().div_ceil(fragment_len) as i32;
        payload.chunks(fragment_len)
            .enumerate()
            .map(|(i, chunk)| {
                let mut cmd = Command::fragment(0, FragmentInfo {
                    start_sequence,
                    fragment_count,
                    fragment_number: i as i32,
                    total_length: payload.len() as i32,
                    fragment_offset: (i * fragment_len) as i32,
                }, Bytes::copy_from_slice(chunk));
                cmd.reliable_sequence = start_sequence + i as i32;
                cmd.fragments_remaining = fragment_count;
                cmd
            })
            .collect()
    }

    fn permutations(items: &[i32]) -> Vec<Vec<i32>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut result = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                result.push(tail);
            }
        }
        result
    }

    fn drain(channel: &mut Channel) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        while let Some(payload) = channel.next_dispatch(0) {
            result.push(payload.to_vec());
        }
        result
    }

    #[test]
    fn test_in_order_delivery_for_all_permutations() {
        let all = permutations(&[1, 2, 3, 4, 5]);
        assert_eq!(all.len(), 120);

        for order in all {
            let mut channel = Channel::new(0);
            for &seq in &order {
                assert!(channel.admit_incoming(reliable(seq)).is_some());
            }
            assert_eq!(drain(&mut channel), vec![vec![1], vec![2], vec![3], vec![4], vec![5]], "order {:?}", order);
            assert_eq!(channel.next_dispatch(0), None);
            assert_eq!(channel.incoming_reliable_sequence, 5);
        }
    }

    #[test]
    fn test_gap_blocks_delivery() {
        let mut channel = Channel::new(0);
        channel.admit_incoming(reliable(2));
        channel.admit_incoming(reliable(3));
        assert_eq!(channel.next_dispatch(0), None);

        channel.admit_incoming(reliable(1));
        assert_eq!(drain(&mut channel), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_duplicate_and_stale_rejection() {
        let mut channel = Channel::new(0);
        assert_eq!(channel.admit_incoming(reliable(1)), Some(0));
        assert_eq!(channel.admit_incoming(reliable(2)), Some(1));
        assert_eq!(channel.admit_incoming(reliable(2)), None);
        assert_eq!(channel.incoming_reliable.len(), 2);

        assert_eq!(drain(&mut channel).len(), 2);
        assert_eq!(channel.admit_incoming(reliable(1)), None);
        assert_eq!(channel.admit_incoming(reliable(2)), None);
        assert!(channel.incoming_reliable.is_empty());
        assert_eq!(channel.next_dispatch(0), None);
    }

    #[rstest]
    #[case::reverse(vec![4, 3, 2, 1, 0])]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    #[case::start_last(vec![1, 2, 3, 4, 0])]
    #[case::start_first(vec![0, 4, 2, 3, 1])]
    fn test_fragment_reassembly(#[case] arrival_order: Vec<usize>) {
        let payload = (0..5000).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let parts = fragments(&payload, 1000, 1);
        assert_eq!(parts.len(), 5);

        let mut channel = Channel::new(0);
        for (n, &i) in arrival_order.iter().enumerate() {
            assert_eq!(channel.next_dispatch(0), None, "payload must not be available after {} fragments", n);
            assert!(channel.admit_fragment(parts[i].clone()).is_some());
        }

        assert_eq!(channel.next_dispatch(0).unwrap().to_vec(), payload);
        assert_eq!(channel.next_dispatch(0), None);
        assert!(channel.incoming_reliable.is_empty());
        assert_eq!(channel.incoming_reliable_sequence, 5);

        // a late duplicate is stale
        assert!(channel.admit_fragment(parts[2].clone()).is_none());
    }

    #[test]
    fn test_fragment_followed_by_reliable() {
        let payload = vec![7u8; 25];
        let mut channel = Channel::new(0);
        for part in fragments(&payload, 10, 1) {
            channel.admit_fragment(part);
        }
        channel.admit_incoming(reliable(4));

        assert_eq!(drain(&mut channel), vec![payload, vec![4]]);
    }

    #[rstest]
    #[case::number_too_high(FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 3, total_length: 20, fragment_offset: 0 })]
    #[case::offset_beyond_total(FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 1, total_length: 20, fragment_offset: 20 })]
    #[case::payload_beyond_total(FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 1, total_length: 20, fragment_offset: 15 })]
    #[case::negative_offset(FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 1, total_length: 20, fragment_offset: -1 })]
    #[case::count_overflows_sequence(FragmentInfo { start_sequence: 1, fragment_count: i32::MAX, fragment_number: 0, total_length: i32::MAX, fragment_offset: 0 })]
    #[case::count_exceeds_length(FragmentInfo { start_sequence: 1, fragment_count: 20, fragment_number: 0, total_length: 10, fragment_offset: 0 })]
    #[case::sequence_before_start(FragmentInfo { start_sequence: 2, fragment_count: 2, fragment_number: 0, total_length: 20, fragment_offset: 0 })]
    #[case::sequence_after_end(FragmentInfo { start_sequence: -5, fragment_count: 2, fragment_number: 0, total_length: 20, fragment_offset: 0 })]
    fn test_invalid_fragment(#[case] info: FragmentInfo) {
        let mut cmd = Command::fragment(0, info, Bytes::from(vec![0u8; 10]));
        cmd.reliable_sequence = 1;
        let mut channel = Channel::new(0);
        assert!(channel.admit_fragment(cmd).is_none());
        assert!(channel.incoming_reliable.is_empty());
    }

    fn fragment(sequence: i32, info: FragmentInfo, payload_len: usize) -> Command {
        let mut cmd = Command::fragment(0, info, Bytes::from(vec![1u8; payload_len]));
        cmd.reliable_sequence = sequence;
        cmd.fragments_remaining = info.fragment_count;
        cmd
    }

    #[test]
    fn test_fragment_disagreeing_with_first_fragment_is_rejected() {
        let mut channel = Channel::new(0);
        assert!(channel.admit_fragment(fragment(1, FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 0, total_length: 10, fragment_offset: 0 }, 5)).is_some());
        assert!(channel.admit_fragment(fragment(2, FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 1, total_length: 100, fragment_offset: 50 }, 10)).is_none());
        assert_eq!(channel.next_dispatch(0), None);

        assert!(channel.admit_fragment(fragment(2, FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 1, total_length: 10, fragment_offset: 5 }, 5)).is_some());
        assert_eq!(drain(&mut channel), vec![vec![1u8; 10]]);
    }

    #[test]
    fn test_inconsistent_fragments_are_dropped_on_reassembly() {
        let mut channel = Channel::new(0);
        assert!(channel.admit_fragment(fragment(2, FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 1, total_length: 100, fragment_offset: 50 }, 10)).is_some());
        assert!(channel.admit_fragment(fragment(1, FragmentInfo { start_sequence: 1, fragment_count: 2, fragment_number: 0, total_length: 10, fragment_offset: 0 }, 5)).is_some());

        assert_eq!(channel.next_dispatch(0), None);
        assert!(channel.incoming_reliable.is_empty());
        assert_eq!(channel.incoming_reliable_sequence, 2);

        channel.admit_incoming(reliable(3));
        assert_eq!(drain(&mut channel), vec![vec![3]]);
    }

    #[test]
    fn test_fragment_of_dispatched_message_is_stale() {
        let mut channel = Channel::new(0);
        channel.admit_incoming(reliable(1));
        channel.admit_incoming(reliable(2));
        drain(&mut channel);

        let late = fragment(3, FragmentInfo { start_sequence: 1, fragment_count: 3, fragment_number: 2, total_length: 30, fragment_offset: 20 }, 10);
        assert!(channel.admit_fragment(late).is_none());
        assert!(channel.incoming_reliable.is_empty());
    }

    #[test]
    fn test_unreliable_ordering_and_staleness() {
        let mut channel = Channel::new(0);
        assert!(channel.admit_incoming(unreliable(0, 2)).is_some());
        assert!(channel.admit_incoming(unreliable(0, 1)).is_some());
        assert!(channel.admit_incoming(unreliable(0, 1)).is_none());

        assert_eq!(drain(&mut channel), vec![vec![101], vec![102]]);
        assert!(channel.admit_incoming(unreliable(0, 1)).is_none());
        assert!(channel.admit_incoming(unreliable(0, 2)).is_none());
    }

    #[test]
    fn test_unreliable_waits_for_reliable_companion() {
        let mut channel = Channel::new(0);
        channel.admit_incoming(unreliable(1, 1));
        assert_eq!(channel.next_dispatch(0), None);

        channel.admit_incoming(reliable(1));
        assert_eq!(drain(&mut channel), vec![vec![1], vec![101]]);
    }

    #[test]
    fn test_unreliable_with_equal_reliable_companion_is_admitted() {
        // Observed protocol behavior: an unreliable command whose reliable companion equals the
        //  dispatched reliable sequence is still admitted and delivered, only older ones are not.
        let mut channel = Channel::new(0);
        channel.admit_incoming(reliable(1));
        channel.admit_incoming(reliable(2));
        drain(&mut channel);

        assert!(channel.admit_incoming(unreliable(2, 1)).is_some());
        assert!(channel.admit_incoming(unreliable(1, 2)).is_none());
        assert_eq!(drain(&mut channel), vec![vec![101]]);
    }

    #[test]
    fn test_unreliable_limit_evicts_oldest() {
        let mut channel = Channel::new(0);
        for seq in 1..=5 {
            channel.admit_incoming(unreliable(0, seq));
        }
        assert_eq!(channel.next_dispatch(2).unwrap().to_vec(), vec![104]);
        assert_eq!(channel.next_dispatch(2).unwrap().to_vec(), vec![105]);
        assert_eq!(channel.next_dispatch(2), None);
    }

    #[test]
    fn test_queue_outgoing_sequences() {
        let mut channel = Channel::new(0);
        channel.queue_outgoing_reliable(reliable(0));
        channel.queue_outgoing_unreliable(unreliable(0, 0));
        channel.queue_outgoing_unreliable(unreliable(0, 0));
        channel.queue_outgoing_reliable(reliable(0));
        channel.queue_outgoing_reliable(reliable(17));

        let rel = channel.outgoing_reliable.iter().map(|c| c.reliable_sequence).collect::<Vec<_>>();
        assert_eq!(rel, vec![1, 2, 17]);
        let unrel = channel.outgoing_unreliable.iter().map(|c| (c.reliable_sequence, c.unreliable_sequence)).collect::<Vec<_>>();
        assert_eq!(unrel, vec![(1, 1), (1, 2)]);
        assert!(channel.has_outgoing());

        channel.clear_all();
        assert!(!channel.has_outgoing());
    }
}
