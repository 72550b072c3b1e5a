use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use itertools::Itertools;
use tempfile::NamedTempFile;

use crate::constants::{ABORT_FAILURE_REASON, PERSIST_RETRY_INTERVAL_MS};
use crate::error::{PieceManagerErr, Result};
use crate::helpers;
use crate::kv_store::KeyValueStore;
use crate::metadata::{
    DealInfo, DealLocation, GetProvingSectorResult, SectorEvent, SectorRecord, SectorStateKind,
};
use crate::metadata_manager::SectorMetadataManager;
use crate::sealer::{SealerInput, StageReport, StageTask, UnsealTask, UnsealedStream};
use crate::store::SectorStore;
use crate::types::{DealId, SectorNumber, UnpaddedBytesAmount};

pub struct Scheduler {
    pub thread: Option<thread::JoinHandle<()>>,
}

#[derive(Debug)]
pub struct PerformHealthCheck(pub bool);

#[derive(Debug)]
pub enum UnsealTarget {
    Sector(SectorNumber),
    Deal(DealId),
}

#[derive(Debug)]
pub enum Request {
    AddPiece {
        deal_info: DealInfo,
        piece_size: UnpaddedBytesAmount,
        piece_file: NamedTempFile,
        tx: mpsc::SyncSender<Result<DealLocation>>,
    },
    PledgeSector(mpsc::SyncSender<Result<SectorNumber>>),
    SealOpenSector(mpsc::SyncSender<Result<Option<SectorNumber>>>),
    LocatePiece(DealId, mpsc::SyncSender<Result<DealLocation>>),
    GetSealStatus(SectorNumber, mpsc::SyncSender<Result<SectorStateKind>>),
    GetSectors(mpsc::SyncSender<Vec<SectorRecord>>),
    GetProvingSectors(
        PerformHealthCheck,
        mpsc::SyncSender<Result<Vec<GetProvingSectorResult>>>,
    ),
    Unseal(UnsealTarget, mpsc::SyncSender<Result<UnsealedStream>>),
    AbortSealing(SectorNumber, mpsc::SyncSender<Result<()>>),
    Subscribe(mpsc::SyncSender<SectorEvent>),
    HandleStageResult(StageReport),
    Shutdown,
}

// Hands stage tasks to the sealer pool. The pool's queue is unbounded, so a
// busy pool never stalls the scheduler.
fn dispatch(
    sealer_tx: &mpsc::Sender<SealerInput>,
    done_tx: &mpsc::SyncSender<Request>,
    tasks: Vec<StageTask>,
) {
    for task in tasks {
        debug!(
            "queueing {:?} for sector {}",
            task.stage, task.sector_number
        );

        let sector_number = task.sector_number;
        let sent = sealer_tx.send(SealerInput::Seal {
            task,
            done_tx: done_tx.clone(),
        });

        if sent.is_err() {
            error!("sealer pool gone, sector {} not queued", sector_number);
        }
    }
}

fn dispatch_unseal<T: KeyValueStore, S: SectorStore>(
    m: &SectorMetadataManager<T, S>,
    sealer_tx: &mpsc::Sender<SealerInput>,
    task: Result<UnsealTask>,
    tx: mpsc::SyncSender<Result<UnsealedStream>>,
) {
    let prepared = task.and_then(|task| Ok((task, m.new_unsealed_file()?)));

    match prepared {
        Ok((task, destination)) => {
            let sent = sealer_tx.send(SealerInput::Unseal {
                task,
                destination,
                caller_done_tx: tx,
            });

            if let Err(mpsc::SendError(SealerInput::Unseal { caller_done_tx, .. })) = sent {
                let _ = caller_done_tx.send(Err(PieceManagerErr::ShutDown));
            }
        }
        Err(err) => {
            let _ = tx.send(Err(err));
        }
    }
}

impl Scheduler {
    pub fn start<T: 'static + KeyValueStore, S: 'static + SectorStore>(
        scheduler_tx: mpsc::SyncSender<Request>,
        scheduler_rx: mpsc::Receiver<Request>,
        sealer_tx: mpsc::Sender<SealerInput>,
        mut m: SectorMetadataManager<T, S>,
    ) -> Result<Scheduler> {
        let resumed = m.resumable_tasks();
        if !resumed.is_empty() {
            info!(
                "resuming sector pipelines: {}",
                resumed.iter().map(|t| t.sector_number).join(", ")
            );
        }
        dispatch(&sealer_tx, &scheduler_tx, resumed);

        let thread = thread::spawn(move || {
            let retry_interval = Duration::from_millis(PERSIST_RETRY_INTERVAL_MS);
            let mut retry_at: Option<Instant> = None;

            loop {
                let received = match retry_at {
                    Some(at) => {
                        match scheduler_rx.recv_timeout(at.saturating_duration_since(Instant::now()))
                        {
                            Ok(task) => Some(task),
                            Err(mpsc::RecvTimeoutError::Timeout) => None,
                            Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    None => match scheduler_rx.recv() {
                        Ok(task) => Some(task),
                        Err(_) => break,
                    },
                };

                // Callers which stopped waiting for a reply are not an error,
                // so failed reply sends are ignored throughout.
                if let Some(task) = received {
                    match task {
                        Request::AddPiece {
                            deal_info,
                            piece_size,
                            mut piece_file,
                            tx,
                        } => {
                            let result = m
                                .add_piece(deal_info, piece_size, piece_file.as_file_mut())
                                .map(|(location, tasks)| {
                                    dispatch(&sealer_tx, &scheduler_tx, tasks);
                                    location
                                });

                            let _ = tx.send(result);
                        }
                        Request::PledgeSector(tx) => {
                            let result = m.pledge_sector().map(|(sector_number, tasks)| {
                                dispatch(&sealer_tx, &scheduler_tx, tasks);
                                sector_number
                            });

                            let _ = tx.send(result);
                        }
                        Request::SealOpenSector(tx) => {
                            let result = m.seal_open_sector().map(|sealed| {
                                sealed.map(|(sector_number, tasks)| {
                                    dispatch(&sealer_tx, &scheduler_tx, tasks);
                                    sector_number
                                })
                            });

                            let _ = tx.send(result);
                        }
                        Request::LocatePiece(deal_id, tx) => {
                            let _ = tx.send(m.locate_piece(deal_id));
                        }
                        Request::GetSealStatus(sector_number, tx) => {
                            let _ = tx.send(m.get_seal_status(sector_number));
                        }
                        Request::GetSectors(tx) => {
                            let _ = tx.send(m.get_sectors());
                        }
                        Request::GetProvingSectors(check_health, tx) => {
                            let proving = m.proving_sectors();

                            if check_health.0 {
                                // hashing replicas takes a while
                                rayon::spawn(move || {
                                    let _ = tx.send(helpers::check_proving_sectors(proving, true));
                                });
                            } else {
                                let _ = tx.send(helpers::check_proving_sectors(proving, false));
                            }
                        }
                        Request::Unseal(target, tx) => {
                            let task = match target {
                                UnsealTarget::Sector(n) => m.create_unseal_task(n),
                                UnsealTarget::Deal(deal_id) => m.create_unseal_piece_task(deal_id),
                            };

                            dispatch_unseal(&m, &sealer_tx, task, tx);
                        }
                        Request::AbortSealing(sector_number, tx) => {
                            let _ = tx.send(m.abort_sealing(sector_number, ABORT_FAILURE_REASON));
                        }
                        Request::Subscribe(tx) => m.subscribe(tx),
                        Request::HandleStageResult(report) => {
                            let (sector_number, stage) = (report.sector_number, report.stage);

                            match m.handle_stage_result(report) {
                                Ok(next) => {
                                    dispatch(&sealer_tx, &scheduler_tx, next.into_iter().collect())
                                }
                                Err(err) => error!(
                                    "sector {}: could not record {:?} result: {}",
                                    sector_number, stage, err
                                ),
                            }
                        }
                        // sectors stay in their persisted stage and resume on the
                        // next start
                        Request::Shutdown => {
                            info!("scheduler shutting down");
                            break;
                        }
                    }
                }

                if !m.has_unrecorded_results() {
                    retry_at = None;
                    continue;
                }

                match retry_at {
                    Some(at) if Instant::now() >= at => {
                        let tasks = m.retry_unrecorded_results();
                        dispatch(&sealer_tx, &scheduler_tx, tasks);

                        retry_at = if m.has_unrecorded_results() {
                            Some(Instant::now() + retry_interval)
                        } else {
                            None
                        };
                    }
                    Some(_) => (),
                    None => retry_at = Some(Instant::now() + retry_interval),
                }
            }
        });

        Ok(Scheduler {
            thread: Some(thread),
        })
    }
}
