//! IPC outcome error classes.

use core::fmt;

/// The 4-bit error class carried by an outcome dope.
///
/// Codes 1..=15; the low bit is set for errors that arose while sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum IpcError {
    /// Destination or source identifier does not resolve
    NotExistent = 1,
    /// Receive timeout expired
    ReceiveTimeout = 2,
    /// Send timeout expired
    SendTimeout = 3,
    /// Receive cancelled from outside
    ReceiveCancelled = 4,
    /// Send cancelled from outside
    SendCancelled = 5,
    /// Flexpage could not be mapped (receiver's view)
    ReceiveMapFailed = 6,
    /// Flexpage could not be mapped (sender's view)
    SendMapFailed = 7,
    /// Fault in the sender's buffer timed out (receiver's view)
    ReceiveSendPfTimeout = 8,
    /// Fault in the sender's buffer timed out (sender's view)
    SendSendPfTimeout = 9,
    /// Fault in the receiver's buffer timed out (receiver's view)
    ReceiveReceivePfTimeout = 10,
    /// Fault in the receiver's buffer timed out (sender's view)
    SendReceivePfTimeout = 11,
    /// Partner vanished while receiving
    ReceiveAborted = 12,
    /// Partner vanished while sending
    SendAborted = 13,
    /// Receiver's buffer or string capacity too small (receiver's view)
    ReceiveMessageCut = 14,
    /// Receiver's buffer or string capacity too small (sender's view)
    SendMessageCut = 15,
}

impl IpcError {
    /// All classes in code order.
    pub const ALL: [IpcError; 15] = [
        IpcError::NotExistent,
        IpcError::ReceiveTimeout,
        IpcError::SendTimeout,
        IpcError::ReceiveCancelled,
        IpcError::SendCancelled,
        IpcError::ReceiveMapFailed,
        IpcError::SendMapFailed,
        IpcError::ReceiveSendPfTimeout,
        IpcError::SendSendPfTimeout,
        IpcError::ReceiveReceivePfTimeout,
        IpcError::SendReceivePfTimeout,
        IpcError::ReceiveAborted,
        IpcError::SendAborted,
        IpcError::ReceiveMessageCut,
        IpcError::SendMessageCut,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decodes a 4-bit class; zero means "no error".
    pub fn from_code(code: u8) -> Option<IpcError> {
        match code {
            1..=15 => Some(Self::ALL[code as usize - 1]),
            _ => None,
        }
    }

    /// True for classes raised in the send phase.
    pub const fn is_send_side(self) -> bool {
        self.code() & 1 == 1
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::NotExistent => write!(f, "partner does not exist"),
            IpcError::ReceiveTimeout => write!(f, "receive timed out"),
            IpcError::SendTimeout => write!(f, "send timed out"),
            IpcError::ReceiveCancelled => write!(f, "receive cancelled"),
            IpcError::SendCancelled => write!(f, "send cancelled"),
            IpcError::ReceiveMapFailed => write!(f, "flexpage mapping failed while receiving"),
            IpcError::SendMapFailed => write!(f, "flexpage mapping failed while sending"),
            IpcError::ReceiveSendPfTimeout => {
                write!(f, "receive aborted: page fault in sender's buffer timed out")
            }
            IpcError::SendSendPfTimeout => {
                write!(f, "send aborted: page fault in own buffer timed out")
            }
            IpcError::ReceiveReceivePfTimeout => {
                write!(f, "receive aborted: page fault in own buffer timed out")
            }
            IpcError::SendReceivePfTimeout => {
                write!(f, "send aborted: page fault in receiver's buffer timed out")
            }
            IpcError::ReceiveAborted => write!(f, "receive aborted"),
            IpcError::SendAborted => write!(f, "send aborted"),
            IpcError::ReceiveMessageCut => write!(f, "received message was cut"),
            IpcError::SendMessageCut => write!(f, "sent message was cut"),
        }
    }
}
