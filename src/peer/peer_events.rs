use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::mpsc;
use tracing::trace;

use crate::codec::envelope::{EventData, OperationResponse};
use crate::codec::value::Value;
use crate::rudp::command::Command;

/// Status notifications for the application. The numeric values are the ones used by the
///  protocol's server side and client libraries.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum StatusCode {
    SecurityExceptionOnConnect = 1022,
    ExceptionOnConnect = 1023,
    Connect = 1024,
    Disconnect = 1025,
    Exception = 1026,
    QueueOutgoingReliableWarning = 1027,
    QueueOutgoingUnreliableWarning = 1029,
    SendError = 1030,
    QueueOutgoingAcksWarning = 1031,
    QueueIncomingReliableWarning = 1033,
    QueueIncomingUnreliableWarning = 1035,
    QueueSentWarning = 1037,
    ExceptionOnReceive = 1039,
    TimeoutDisconnect = 1040,
    DisconnectByServer = 1041,
    DisconnectByServerUserLimit = 1042,
    DisconnectByServerLogic = 1043,
    EncryptionEstablished = 1048,
    EncryptionFailedToEstablish = 1049,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    StatusChanged(StatusCode),
    OperationResponse(OperationResponse),
    Event(EventData),
    Message(Value),
    RawMessage(Vec<u8>),
}

/// Work that is handed from the receive path (or from code holding the peer's lock) to the
///  application pump
#[derive(Debug)]
pub enum DeferredAction {
    Status(StatusCode),
    /// a received data-plane command, executed when the application dispatches
    ExecuteCommand(Command),
    CloseTransport,
    Disconnect,
}

/// `true` whenever a queue of length `len` reaches a multiple of `warning_size`
pub fn is_warning_threshold(len: usize, warning_size: usize) -> bool {
    warning_size > 0 && len >= warning_size && len % warning_size == 0
}

pub struct PeerEventNotifier {
    sender: mpsc::UnboundedSender<PeerEvent>,
}
impl PeerEventNotifier {
    pub fn new() -> (PeerEventNotifier, mpsc::UnboundedReceiver<PeerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (PeerEventNotifier { sender }, receiver)
    }

    pub fn send_event(&self, event: PeerEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn send_status(&self, status: StatusCode) {
        self.send_event(PeerEvent::StatusChanged(status));
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(0, 100, false)]
    #[case::below(99, 100, false)]
    #[case::at(100, 100, true)]
    #[case::between(150, 100, false)]
    #[case::multiple(300, 100, true)]
    #[case::size_one(1, 1, true)]
    #[case::disabled(100, 0, false)]
    fn test_is_warning_threshold(#[case] len: usize, #[case] warning_size: usize, #[case] expected: bool) {
        assert_eq!(is_warning_threshold(len, warning_size), expected);
    }

    #[test]
    fn test_status_code_values() {
        assert_eq!(u16::from(StatusCode::Connect), 1024);
        assert_eq!(StatusCode::try_from(1040).unwrap(), StatusCode::TimeoutDisconnect);
        assert!(StatusCode::try_from(1028).is_err());
    }

    #[test]
    fn test_notifier() {
        let (notifier, mut receiver) = PeerEventNotifier::new();
        notifier.send_status(StatusCode::Connect);
        assert_eq!(receiver.try_recv().unwrap(), PeerEvent::StatusChanged(StatusCode::Connect));
        assert!(receiver.try_recv().is_err());
    }
}
