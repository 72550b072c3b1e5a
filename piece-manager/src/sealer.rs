use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tempfile::NamedTempFile;

use crate::error::{PieceManagerErr, Result};
use crate::helpers;
use crate::metadata::{PieceRecord, SealedReplica, SealingStage, StageOutput};
use crate::scheduler::Request;
use crate::types::{SectorNumber, UnpaddedByteIndex, UnpaddedBytesAmount};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SealerError {
    /// Worth retrying, e.g. a chain message that was not yet included.
    #[error("transient sealing fault: {}", _0)]
    Transient(String),

    #[error("fatal sealing fault: {}", _0)]
    Fatal(String),
}

/// Everything the external sealer needs to run one stage of a sector's
/// pipeline.
#[derive(Debug, Clone)]
pub struct StageTask {
    pub sector_number: SectorNumber,
    pub stage: SealingStage,
    pub pieces: Vec<PieceRecord>,
    pub staged_sector_path: PathBuf,
    pub sealed_sector_path: PathBuf,
    /// Outputs of all earlier stages, in pipeline order.
    pub previous_outputs: Vec<StageOutput>,
}

/// What a worker reports back after running one stage.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub sector_number: SectorNumber,
    pub stage: SealingStage,
    pub result: std::result::Result<StageOutput, SealerError>,
    /// Length and checksum of the sealed replica, taken once the final stage
    /// succeeds.
    pub replica: Option<SealedReplica>,
}

#[derive(Debug, Clone)]
pub struct UnsealTask {
    pub sector_number: SectorNumber,
    pub pieces: Vec<PieceRecord>,
    pub staged_sector_path: PathBuf,
    pub sealed_sector_path: PathBuf,
    pub outputs: Vec<StageOutput>,
    pub start: UnpaddedByteIndex,
    pub len: UnpaddedBytesAmount,
}

/// The cryptographic sealing and proving machinery. Implementations compute
/// replicas and proofs; the piece manager only persists what they report.
pub trait Sealer: Send + Sync {
    fn run_stage(&self, task: &StageTask) -> std::result::Result<StageOutput, SealerError>;

    /// Writes the unsealed bytes `[task.start, task.start + task.len)` of the
    /// sector to `destination`, returning the number of bytes written.
    fn unseal(
        &self,
        task: &UnsealTask,
        destination: &mut dyn Write,
    ) -> std::result::Result<UnpaddedBytesAmount, SealerError>;
}

/// Unsealed sector bytes. The backing temporary file is removed when the
/// stream is closed or dropped.
#[derive(Debug)]
pub struct UnsealedStream {
    sector_number: SectorNumber,
    len: UnpaddedBytesAmount,
    reader: BufReader<File>,
    _backing: NamedTempFile,
}

impl UnsealedStream {
    pub fn sector_number(&self) -> SectorNumber {
        self.sector_number
    }

    pub fn len(&self) -> UnpaddedBytesAmount {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len.0 == 0
    }

    pub fn close(self) {}
}

impl Read for UnsealedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

pub enum SealerInput {
    Seal {
        task: StageTask,
        done_tx: mpsc::SyncSender<Request>,
    },
    Unseal {
        task: UnsealTask,
        destination: NamedTempFile,
        caller_done_tx: mpsc::SyncSender<Result<UnsealedStream>>,
    },
    Shutdown,
}

pub struct SealerWorker {
    pub id: usize,
    pub thread: Option<thread::JoinHandle<()>>,
}

impl SealerWorker {
    pub fn start(
        id: usize,
        seal_task_rx: Arc<Mutex<mpsc::Receiver<SealerInput>>>,
        sealer: Arc<dyn Sealer>,
        cancelled: Arc<AtomicBool>,
    ) -> SealerWorker {
        let thread = thread::spawn(move || loop {
            // Acquire a lock on the rx end of the channel, get a task,
            // relinquish the lock and return the task. The receiver is mutexed
            // for coordinating reads across multiple worker-threads.
            let task = {
                let rx = match seal_task_rx.lock() {
                    Ok(rx) => rx,
                    Err(_) => {
                        error!("sealer worker {}: task lock poisoned", id);
                        break;
                    }
                };

                match rx.recv() {
                    Ok(task) => task,
                    Err(_) => break,
                }
            };

            // Dispatch to the appropriate task-handler.
            match task {
                SealerInput::Seal { task, done_tx } => {
                    if cancelled.load(Ordering::SeqCst) {
                        debug!(
                            "sealer worker {}: skipping {:?} for sector {}",
                            id, task.stage, task.sector_number
                        );
                        continue;
                    }

                    debug!(
                        "sealer worker {}: running {:?} for sector {}",
                        id, task.stage, task.sector_number
                    );

                    let result = sealer.run_stage(&task);

                    let replica = match (&result, task.stage) {
                        (Ok(_), SealingStage::FinalizeSector) => {
                            match helpers::describe_replica(&task.sealed_sector_path) {
                                Ok(replica) => Some(replica),
                                Err(err) => {
                                    warn!(
                                        "sealer worker {}: no sealed replica for sector {} at {}: {}",
                                        id,
                                        task.sector_number,
                                        task.sealed_sector_path.display(),
                                        err
                                    );
                                    None
                                }
                            }
                        }
                        _ => None,
                    };

                    let sent = done_tx.send(Request::HandleStageResult(StageReport {
                        sector_number: task.sector_number,
                        stage: task.stage,
                        result,
                        replica,
                    }));

                    if sent.is_err() {
                        warn!(
                            "sealer worker {}: scheduler gone, dropping {:?} result for sector {}",
                            id, task.stage, task.sector_number
                        );
                    }
                }
                SealerInput::Unseal {
                    task,
                    destination,
                    caller_done_tx,
                } => {
                    let result = unseal_into(sealer.as_ref(), &task, destination);

                    // the caller may have given up waiting, which drops the
                    // temporary file along with the result
                    let _ = caller_done_tx.send(result);
                }
                SealerInput::Shutdown => break,
            }
        });

        SealerWorker {
            id,
            thread: Some(thread),
        }
    }
}

fn unseal_into(
    sealer: &dyn Sealer,
    task: &UnsealTask,
    mut destination: NamedTempFile,
) -> Result<UnsealedStream> {
    let written = sealer.unseal(task, &mut destination)?;
    destination.as_file().sync_data()?;

    if written != task.len {
        return Err(PieceManagerErr::SealingFailed {
            sector_number: task.sector_number,
            reason: format!(
                "unsealed {} bytes, expected {}",
                written, task.len
            ),
        });
    }

    let reader = BufReader::new(destination.reopen()?);

    Ok(UnsealedStream {
        sector_number: task.sector_number,
        len: written,
        reader,
        _backing: destination,
    })
}
