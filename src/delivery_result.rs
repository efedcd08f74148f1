use std::fmt;

use crate::envelope::EnvelopeError;
use crate::worker::mx::ResolveError;
use crate::worker::smtp::DeliveryError;

/// Where a queue file is in its processing for the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Extracting,
    Resolving,
    Delivering,
    ReadFailed,
    ExtractFailed,
    ResolveFailed,
    DeliverFailed,
    Cancelled,
    Delivered,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        match self {
            FileState::Pending
            | FileState::Extracting
            | FileState::Resolving
            | FileState::Delivering => false,
            _ => true,
        }
    }

    /// Only a fully delivered message leaves the queue
    pub fn removes_file(self) -> bool {
        self == FileState::Delivered
    }
}

/// The result of processing one queue file during one run
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// Every recipient accepted the message
    Delivered { recipients: usize },

    ReadFailed(String),

    ExtractFailed(EnvelopeError),

    ResolveFailed {
        recipient: String,
        error: ResolveError,
    },

    DeliverFailed {
        recipient: String,
        host: String,
        error: DeliveryError,
    },

    /// A shutdown request stopped processing before all recipients were done
    Cancelled,
}

impl MessageOutcome {
    pub fn state(&self) -> FileState {
        match *self {
            MessageOutcome::Delivered { .. } => FileState::Delivered,
            MessageOutcome::ReadFailed(_) => FileState::ReadFailed,
            MessageOutcome::ExtractFailed(_) => FileState::ExtractFailed,
            MessageOutcome::ResolveFailed { .. } => FileState::ResolveFailed,
            MessageOutcome::DeliverFailed { .. } => FileState::DeliverFailed,
            MessageOutcome::Cancelled => FileState::Cancelled,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state().removes_file()
    }
}

impl fmt::Display for MessageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MessageOutcome::Delivered { recipients } => {
                write!(f, "delivered to {} recipient(s)", recipients)
            }
            MessageOutcome::ReadFailed(ref e) => write!(f, "read error: {}", e),
            MessageOutcome::ExtractFailed(ref e) => write!(f, "parse error: {}", e),
            MessageOutcome::ResolveFailed {
                ref recipient,
                ref error,
            } => write!(f, "resolve error for {}: {}", recipient, error),
            MessageOutcome::DeliverFailed {
                ref recipient,
                ref host,
                ref error,
            } => write!(f, "delivery error for {} via {}: {}", recipient, host, error),
            MessageOutcome::Cancelled => write!(f, "cancelled by shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::smtp::{FailureClass, Stage};

    #[test]
    fn only_delivered_removes_the_file() {
        assert!(MessageOutcome::Delivered { recipients: 2 }.succeeded());
        assert!(!MessageOutcome::Cancelled.succeeded());
        assert!(!MessageOutcome::ExtractFailed(EnvelopeError::MissingTo).succeeded());

        let failed = MessageOutcome::DeliverFailed {
            recipient: "c@z.test".to_owned(),
            host: "mx.z.test".to_owned(),
            error: DeliveryError::new(Stage::Connect, FailureClass::Transient, "refused"),
        };
        assert_eq!(failed.state(), FileState::DeliverFailed);
        assert!(failed.state().is_terminal());
        assert!(!FileState::Resolving.is_terminal());
        assert_eq!(
            failed.to_string(),
            "delivery error for c@z.test via mx.z.test: connect failed (transient): refused"
        );
    }
}
