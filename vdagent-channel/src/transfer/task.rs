//! Per-file transfer pump
//!
//! The pump drives one file through its lifecycle: open and stat, announce
//! with the keyfile manifest, wait for the guest's go-ahead, then read and
//! flush one buffer at a time until EOF and the final status. At most one
//! async operation is in flight at any point; flush-waiting on the token
//! queue is the only backpressure.

use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::*;
use crate::queue::FlushError;
use crate::session::Command;

use super::{TaskOutcome, TaskStatusIn, TransferError, FILE_XFER_CHUNK_SIZE};

enum Flush {
    Flushed,
    Cancelled,
    Gone,
}

pub(crate) struct TaskPump {
    pub id: u32,
    pub path: PathBuf,
    pub cancel: CancellationToken,
    pub status: mpsc::UnboundedReceiver<TaskStatusIn>,
    pub actor: mpsc::UnboundedSender<Command>,
}

impl TaskPump {
    pub async fn run(mut self) {
        let outcome = self.drive().await;

        debug!(id = self.id, ?outcome, "transfer task finished");
        let _ = self.actor.send(Command::XferFinished {
            id: self.id,
            outcome,
        });
    }

    async fn drive(&mut self) -> TaskOutcome {
        // Initializing: open lazily, then stat. A cancel here aborts
        // before anything reached the guest.
        let mut file = tokio::select! {
            _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
            opened = tokio::fs::File::open(&self.path) => match opened {
                Ok(file) => file,
                Err(err) => return TaskOutcome::Failed(TransferError::Io(err.to_string())),
            },
        };

        let meta = tokio::select! {
            _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
            meta = file.metadata() => match meta {
                Ok(meta) => meta,
                Err(err) => return TaskOutcome::Failed(TransferError::Io(err.to_string())),
            },
        };

        let size = meta.len();
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned());

        let (tx, rx) = oneshot::channel();
        let _ = self.actor.send(Command::XferStart {
            id: self.id,
            name,
            size,
            flush: tx,
        });

        // From here on the guest knows about the task; a local cancel must
        // tell it so.
        match self.await_flush(rx).await {
            Flush::Flushed => {}
            Flush::Cancelled => return self.cancelled_out(),
            Flush::Gone => return TaskOutcome::Failed(TransferError::AgentGone),
        }

        // AwaitingAgentGo
        loop {
            let status = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled_out(),
                status = self.status.recv() => status,
            };

            match status {
                Some(TaskStatusIn::Agent { result, .. })
                    if result == VD_AGENT_FILE_XFER_STATUS_CAN_SEND_DATA =>
                {
                    break;
                }
                Some(TaskStatusIn::Agent { result, extra }) => {
                    return self.terminal_status(result, &extra, size);
                }
                Some(TaskStatusIn::AgentGone) | None => {
                    return TaskOutcome::Failed(TransferError::AgentGone);
                }
            }
        }

        // Sending
        if size == 0 {
            // A zero-size file still needs one empty data message so the
            // guest sees its EOF.
            let (tx, rx) = oneshot::channel();
            let _ = self.actor.send(Command::XferData {
                id: self.id,
                data: Vec::new(),
                flush: tx,
            });
            match self.await_flush(rx).await {
                Flush::Flushed => {}
                Flush::Cancelled => return self.cancelled_out(),
                Flush::Gone => return TaskOutcome::Failed(TransferError::AgentGone),
            }
        } else {
            let mut buf = vec![0u8; FILE_XFER_CHUNK_SIZE];
            let mut read_total: u64 = 0;

            loop {
                // Progress reflects what is already flushed, so the last
                // round reports 100% before the EOF read would happen.
                let _ = self.actor.send(Command::XferProgress { id: self.id });

                if read_total == size {
                    break;
                }

                let n = tokio::select! {
                    _ = self.cancel.cancelled() => return self.cancelled_out(),
                    read = file.read(&mut buf) => match read {
                        Ok(n) => n,
                        Err(err) => {
                            let _ = self.actor.send(Command::XferStatusOut {
                                id: self.id,
                                result: VD_AGENT_FILE_XFER_STATUS_ERROR,
                            });
                            return TaskOutcome::Failed(TransferError::Io(err.to_string()));
                        }
                    },
                };

                if n == 0 {
                    // Never send an empty data message for a non-empty
                    // file, the guest treats that as corruption.
                    warn!(
                        id = self.id,
                        read_total, size, "file shrank while being transferred"
                    );
                    break;
                }

                read_total += n as u64;

                let (tx, rx) = oneshot::channel();
                let _ = self.actor.send(Command::XferData {
                    id: self.id,
                    data: buf[..n].to_vec(),
                    flush: tx,
                });

                match self.await_flush(rx).await {
                    Flush::Flushed => {}
                    Flush::Cancelled => return self.cancelled_out(),
                    Flush::Gone => return TaskOutcome::Failed(TransferError::AgentGone),
                }
            }
        }

        // Draining: everything is out, the guest has the last word.
        loop {
            let status = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled_out(),
                status = self.status.recv() => status,
            };

            match status {
                Some(TaskStatusIn::Agent { result, extra }) => {
                    return self.terminal_status(result, &extra, size);
                }
                Some(TaskStatusIn::AgentGone) | None => {
                    return TaskOutcome::Failed(TransferError::AgentGone);
                }
            }
        }
    }

    fn terminal_status(&self, result: u32, extra: &[u8], size: u64) -> TaskOutcome {
        match result {
            VD_AGENT_FILE_XFER_STATUS_SUCCESS => TaskOutcome::Success,
            VD_AGENT_FILE_XFER_STATUS_CANCELLED => {
                TaskOutcome::Failed(TransferError::AgentCancelled)
            }
            VD_AGENT_FILE_XFER_STATUS_ERROR => TaskOutcome::Failed(TransferError::AgentFailure),
            VD_AGENT_FILE_XFER_STATUS_NOT_ENOUGH_SPACE => {
                let free = vdagent_codec::Reader::new(extra).u64().unwrap_or(0);
                TaskOutcome::Failed(TransferError::NotEnoughSpace { free, needed: size })
            }
            VD_AGENT_FILE_XFER_STATUS_SESSION_LOCKED => {
                TaskOutcome::Failed(TransferError::SessionLocked)
            }
            VD_AGENT_FILE_XFER_STATUS_VDAGENT_NOT_CONNECTED => {
                TaskOutcome::Failed(TransferError::GuestAgentNotConnected)
            }
            VD_AGENT_FILE_XFER_STATUS_DISABLED => TaskOutcome::Failed(TransferError::Disabled),
            other => TaskOutcome::Failed(TransferError::UnexpectedStatus(other)),
        }
    }

    /// Local cancellation after the guest learned about the task.
    fn cancelled_out(&self) -> TaskOutcome {
        let _ = self.actor.send(Command::XferStatusOut {
            id: self.id,
            result: VD_AGENT_FILE_XFER_STATUS_CANCELLED,
        });
        TaskOutcome::Cancelled
    }

    async fn await_flush(
        &mut self,
        rx: oneshot::Receiver<Result<(), FlushError>>,
    ) -> Flush {
        tokio::select! {
            _ = self.cancel.cancelled() => Flush::Cancelled,
            flushed = rx => match flushed {
                Ok(Ok(())) => Flush::Flushed,
                Ok(Err(FlushError::AgentGone)) | Err(_) => Flush::Gone,
            },
        }
    }
}
