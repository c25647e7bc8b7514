use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::types::TransferStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    Approve,
    Reject,
    Start,
    Pause,
    Resume,
    Cancel,
    Complete,
    Fail,
}

impl TransferEvent {
    fn op_name(&self) -> &'static str {
        match self {
            TransferEvent::Approve => "approve",
            TransferEvent::Reject => "reject",
            TransferEvent::Start => "start",
            TransferEvent::Pause => "pause",
            TransferEvent::Resume => "resume",
            TransferEvent::Cancel => "cancel",
            TransferEvent::Complete => "complete",
            TransferEvent::Fail => "fail",
        }
    }
}

/// Transfer state table. The record lock serializes transitions; this is
/// the single place that decides which pairs are legal.
pub fn transition(status: TransferStatus, event: TransferEvent) -> TransferResult<TransferStatus> {
    use TransferEvent as E;
    use TransferStatus as S;

    let next = match (status, event) {
        (S::Pending, E::Approve) => S::Approved,
        (S::Pending, E::Reject) => S::Rejected,
        (S::Approved, E::Start) => S::InProgress,
        // Zero-byte transfers finish without chunk traffic.
        (S::Approved, E::Complete) => S::Completed,
        (S::InProgress, E::Pause) => S::Paused,
        (S::Paused, E::Resume) => S::InProgress,
        (S::InProgress, E::Complete) => S::Completed,
        (S::Approved | S::InProgress | S::Paused, E::Cancel) => S::Cancelled,
        (S::Approved | S::InProgress | S::Paused, E::Fail) => S::Failed,
        _ => {
            return Err(TransferError::InvalidState {
                op: event.op_name(),
                status,
            })
        }
    };
    Ok(next)
}
