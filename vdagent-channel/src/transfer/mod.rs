//! Host-to-guest file transfer engine
//!
//! Each file is one task with its own pump; a copy call is one operation
//! aggregating the tasks it created. The session actor owns the operation
//! and routes guest status messages to the pumps by task id.

mod task;

pub(crate) use task::TaskPump;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::protocol::VD_AGENT_MAX_DATA_SIZE;

/// Read buffer size of the per-file pump. One buffer becomes one
/// `FILE_XFER_DATA` message.
pub const FILE_XFER_CHUNK_SIZE: usize = VD_AGENT_MAX_DATA_SIZE * 32;

/// Progress observer: `(total_sent, transfer_size)` over the whole
/// operation.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

/// Why one file transfer task stopped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("the agent cancelled the file transfer")]
    AgentCancelled,

    #[error("the agent reported an error during the file transfer")]
    AgentFailure,

    #[error(
        "file transfer failed due to lack of free space on remote machine \
         ({free} free, {needed} to transfer)"
    )]
    NotEnoughSpace { free: u64, needed: u64 },

    #[error("user's session is locked and cannot transfer files, unlock it and try again")]
    SessionLocked,

    #[error("session agent not connected")]
    GuestAgentNotConnected,

    #[error("file transfer is disabled")]
    Disabled,

    #[error("unhandled transfer status {0}")]
    UnexpectedStatus(u32),

    #[error("agent disconnected")]
    AgentGone,

    #[error("{0}")]
    Io(String),
}

/// Result of a whole copy call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CopyError {
    #[error("the agent is not connected")]
    AgentNotConnected,

    #[error("the file transfer is disabled")]
    Disabled,

    #[error(
        "transferring {num_files} files: {succeed} succeed, \
         {cancelled} cancelled, {failed} failed"
    )]
    Failed {
        num_files: u32,
        succeed: u32,
        cancelled: u32,
        failed: u32,
    },

    #[error(
        "transferring {num_files} files: {succeed} succeed, \
         {cancelled} cancelled, {failed} failed"
    )]
    Cancelled {
        num_files: u32,
        succeed: u32,
        cancelled: u32,
        failed: u32,
    },

    #[error("session terminated")]
    SessionClosed,
}

/// Guest status routed to a task pump, or the agent-gone notification.
#[derive(Debug)]
pub(crate) enum TaskStatusIn {
    Agent { result: u32, extra: Vec<u8> },
    AgentGone,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Success,
    Cancelled,
    Failed(TransferError),
}

/// Actor-side bookkeeping for one running task.
pub(crate) struct TaskEntry {
    pub op: u64,
    pub status_tx: mpsc::UnboundedSender<TaskStatusIn>,
    /// Total size from file info, learned when the pump announces the
    /// transfer.
    pub size: u64,
    pub sent: u64,
}

/// Actor-side bookkeeping for one copy call.
pub(crate) struct Operation {
    pub num_files: u32,
    pub remaining: u32,
    pub succeed: u32,
    pub cancelled: u32,
    pub failed: u32,
    pub total_sent: u64,
    pub transfer_size: u64,
    pub progress: Option<ProgressFn>,
    pub reply: Option<oneshot::Sender<Result<(), CopyError>>>,
}

impl Operation {
    pub fn new(
        num_files: u32,
        progress: Option<ProgressFn>,
        reply: oneshot::Sender<Result<(), CopyError>>,
    ) -> Self {
        Self {
            num_files,
            remaining: num_files,
            succeed: 0,
            cancelled: 0,
            failed: 0,
            total_sent: 0,
            transfer_size: 0,
            progress,
            reply: Some(reply),
        }
    }

    pub fn emit_progress(&mut self) {
        if let Some(progress) = self.progress.as_mut() {
            progress(self.total_sent, self.transfer_size);
        }
    }

    /// Resolve the copy call once the last task has finished. Any failure
    /// wins over cancellation; cancellations alone still succeed when at
    /// least one file made it.
    pub fn resolve(mut self) {
        let Some(reply) = self.reply.take() else {
            return;
        };

        let result = if self.failed > 0 {
            Err(CopyError::Failed {
                num_files: self.num_files,
                succeed: self.succeed,
                cancelled: self.cancelled,
                failed: self.failed,
            })
        } else if self.cancelled > 0 && self.succeed == 0 {
            Err(CopyError::Cancelled {
                num_files: self.num_files,
                succeed: self.succeed,
                cancelled: self.cancelled,
                failed: self.failed,
            })
        } else {
            Ok(())
        };

        debug!(
            num_files = self.num_files,
            succeed = self.succeed,
            cancelled = self.cancelled,
            failed = self.failed,
            "transfer operation resolved"
        );
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(num_files: u32) -> (Operation, oneshot::Receiver<Result<(), CopyError>>) {
        let (tx, rx) = oneshot::channel();
        (Operation::new(num_files, None, tx), rx)
    }

    #[test]
    fn all_success_resolves_ok() {
        let (mut op, mut rx) = operation(2);
        op.succeed = 2;

        op.resolve();

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn any_failure_wins() {
        let (mut op, mut rx) = operation(3);
        op.succeed = 1;
        op.cancelled = 1;
        op.failed = 1;

        op.resolve();

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(CopyError::Failed {
                num_files: 3,
                succeed: 1,
                cancelled: 1,
                failed: 1,
            })
        );
    }

    #[test]
    fn cancellations_with_a_success_still_succeed() {
        let (mut op, mut rx) = operation(2);
        op.succeed = 1;
        op.cancelled = 1;

        op.resolve();

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn all_cancelled_resolves_cancelled() {
        let (mut op, mut rx) = operation(2);
        op.cancelled = 2;

        op.resolve();

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CopyError::Cancelled { cancelled: 2, .. })
        ));
    }
}
