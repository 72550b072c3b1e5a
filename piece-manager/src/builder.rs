use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use tempfile::NamedTempFile;

use crate::config::PieceManagerConfig;
use crate::constants::{SCHEDULER_CHANNEL_CAPACITY, SUBSCRIBER_CHANNEL_CAPACITY};
use crate::disk_backed_storage::DiskSectorStore;
use crate::error::{err_read, PieceManagerErr, Result};
use crate::helpers::{self, SnapshotKey};
use crate::identity::{PersistentSectorIdCounter, SectorIdentitySource};
use crate::kv_store::{FileSystemKvs, KeyValueStore};
use crate::metadata::{
    DealInfo, DealLocation, DealSchedule, GetProvingSectorResult, SectorEvent, SectorRecord,
    SectorStateKind,
};
use crate::metadata_manager::SectorMetadataManager;
use crate::scheduler::{PerformHealthCheck, Request, Scheduler, UnsealTarget};
use crate::sealer::{Sealer, SealerInput, SealerWorker, UnsealedStream};
use crate::store::SectorStore;
use crate::traits::PieceManager;
use crate::types::{ChainEpoch, DealId, SectorNumber, UnpaddedBytesAmount};

const PIECE_READ_BUFFER_SIZE: usize = 1 << 16;

/// Packs deal pieces into sectors and drives them through sealing. Each
/// instance owns its own state, identity source and worker pool.
pub struct SectorPieceManager {
    scheduler_tx: mpsc::SyncSender<Request>,
    scheduler: Scheduler,
    sealers: Vec<SealerWorker>,
    sealer_tx: mpsc::Sender<SealerInput>,
    cancelled: Arc<AtomicBool>,
    sector_store: Arc<dyn SectorStore>,
}

impl SectorPieceManager {
    /// Opens (or creates) the on-disk state described by `config`.
    pub fn init_from_config(
        config: &PieceManagerConfig,
        sealer: Arc<dyn Sealer>,
    ) -> Result<SectorPieceManager> {
        config.validate()?;

        let kv_store = Arc::new(FileSystemKvs::initialize(&config.metadata_dir)?);

        let sector_store = Arc::new(DiskSectorStore::new(
            &config.staged_sector_dir,
            &config.sealed_sector_dir,
            &config.unsealed_sector_dir,
            config.sector_size,
        )?);

        let ids = PersistentSectorIdCounter::initialize(
            kv_store.clone(),
            config.miner_id,
            config.last_committed_sector_number,
        )?;

        SectorPieceManager::init(kv_store, sector_store, Box::new(ids), sealer, config)
    }

    pub fn init<T: 'static + KeyValueStore, S: 'static + SectorStore>(
        kv_store: Arc<T>,
        sector_store: Arc<S>,
        ids: Box<dyn SectorIdentitySource>,
        sealer: Arc<dyn Sealer>,
        config: &PieceManagerConfig,
    ) -> Result<SectorPieceManager> {
        config.validate()?;

        let m = SectorMetadataManager::initialize(
            kv_store,
            sector_store.clone(),
            ids,
            SnapshotKey::new(config.miner_id, config.sector_size),
            config.max_stage_retries,
        )?;

        let (sealer_tx, sealer_rx) = mpsc::channel();
        let sealer_rx = Arc::new(Mutex::new(sealer_rx));
        let cancelled = Arc::new(AtomicBool::new(false));

        let sealers = (0..config.num_workers)
            .map(|n| SealerWorker::start(n, sealer_rx.clone(), sealer.clone(), cancelled.clone()))
            .collect();

        let (scheduler_tx, scheduler_rx) = mpsc::sync_channel(SCHEDULER_CHANNEL_CAPACITY);

        let scheduler = Scheduler::start(scheduler_tx.clone(), scheduler_rx, sealer_tx.clone(), m)?;

        info!(
            "piece manager started for miner {} ({} sealing workers)",
            config.miner_id, config.num_workers
        );

        Ok(SectorPieceManager {
            scheduler_tx,
            scheduler,
            sealers,
            sealer_tx,
            cancelled,
            sector_store,
        })
    }

    /// Closes the open sector, if there is one, and starts sealing it.
    pub fn seal_open_sector(&self) -> Result<Option<SectorNumber>> {
        self.run_blocking(Request::SealOpenSector)?
    }

    /// Reads back the bytes of a deal's piece from its unsealed sector.
    pub fn read_piece_for_deal(&self, deal_id: DealId) -> Result<Vec<u8>> {
        let mut stream =
            self.run_blocking(|tx| Request::Unseal(UnsealTarget::Deal(deal_id), tx))??;

        let mut buf = Vec::with_capacity(u64::from(stream.len()) as usize);
        stream.read_to_end(&mut buf)?;

        Ok(buf)
    }

    pub fn get_seal_status(&self, sector_number: SectorNumber) -> Result<SectorStateKind> {
        self.run_blocking(|tx| Request::GetSealStatus(sector_number, tx))?
    }

    pub fn get_sectors(&self) -> Result<Vec<SectorRecord>> {
        self.run_blocking(Request::GetSectors)
    }

    pub fn get_proving_sectors(&self, check_health: bool) -> Result<Vec<GetProvingSectorResult>> {
        self.run_blocking(|tx| Request::GetProvingSectors(PerformHealthCheck(check_health), tx))?
    }

    /// Stops a sector's pipeline, failing the sector.
    pub fn abort_sealing(&self, sector_number: SectorNumber) -> Result<()> {
        self.run_blocking(|tx| Request::AbortSealing(sector_number, tx))?
    }

    /// Receives an event for every lifecycle transition from now on. A
    /// receiver that falls too far behind misses events.
    pub fn subscribe(&self) -> Result<mpsc::Receiver<SectorEvent>> {
        let (tx, rx) = mpsc::sync_channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.scheduler_tx
            .send(Request::Subscribe(tx))
            .map_err(|_| PieceManagerErr::ShutDown)?;
        Ok(rx)
    }

    // Copies the piece into a temporary staging file so that the scheduler
    // never waits on the caller's reader.
    fn stage_piece(
        &self,
        piece_size: UnpaddedBytesAmount,
        piece_reader: &mut dyn Read,
    ) -> Result<NamedTempFile> {
        let mut file = self.sector_store.new_incoming_piece_file()?;
        let mut buf = vec![0u8; PIECE_READ_BUFFER_SIZE];
        let total = u64::from(piece_size);
        let mut num_bytes_read = 0u64;

        while num_bytes_read < total {
            let want = (total - num_bytes_read).min(buf.len() as u64) as usize;

            let n = match piece_reader.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err_read(num_bytes_read, total, err.to_string())),
            };

            file.write_all(&buf[..n])?;
            num_bytes_read += n as u64;
        }

        if num_bytes_read < total {
            return Err(err_read(
                num_bytes_read,
                total,
                "piece source ended early".to_string(),
            ));
        }

        file.as_file().sync_data()?;
        file.seek(SeekFrom::Start(0))?;

        Ok(file)
    }

    fn run_blocking<T, F: FnOnce(mpsc::SyncSender<T>) -> Request>(
        &self,
        with_sender: F,
    ) -> Result<T> {
        let (tx, rx) = mpsc::sync_channel(1);

        self.scheduler_tx
            .send(with_sender(tx))
            .map_err(|_| PieceManagerErr::ShutDown)?;

        rx.recv().map_err(|_| PieceManagerErr::ShutDown)
    }
}

impl PieceManager for SectorPieceManager {
    fn seal_piece_into_new_sector(
        &self,
        deal_id: DealId,
        deal_start: ChainEpoch,
        deal_end: ChainEpoch,
        piece_size: UnpaddedBytesAmount,
        piece_reader: &mut dyn Read,
    ) -> Result<DealLocation> {
        let deal_schedule = DealSchedule::new(deal_start, deal_end)?;
        helpers::check_piece_size(piece_size, self.sector_store.sector_capacity())?;

        let piece_file = self.stage_piece(piece_size, piece_reader)?;

        self.run_blocking(|tx| Request::AddPiece {
            deal_info: DealInfo {
                deal_id,
                deal_schedule,
            },
            piece_size,
            piece_file,
            tx,
        })?
    }

    fn pledge_sector(&self) -> Result<SectorNumber> {
        self.run_blocking(Request::PledgeSector)?
    }

    fn unseal_sector(&self, sector_number: SectorNumber) -> Result<UnsealedStream> {
        self.run_blocking(|tx| Request::Unseal(UnsealTarget::Sector(sector_number), tx))?
    }

    fn locate_piece_for_deal_within_sector(&self, deal_id: DealId) -> Result<DealLocation> {
        self.run_blocking(|tx| Request::LocatePiece(deal_id, tx))?
    }
}

impl Drop for SectorPieceManager {
    fn drop(&mut self) {
        // queued stage tasks are skipped from here on
        self.cancelled.store(true, Ordering::SeqCst);

        // sealing sectors keep their persisted stage; stage results which
        // arrive after this are dropped and the stage reruns on restart
        let _ = self.scheduler_tx.send(Request::Shutdown);

        if let Some(thread) = self.scheduler.thread.take() {
            if thread.join().is_err() {
                error!("scheduler thread panicked");
            }
        }

        for _ in &self.sealers {
            let _ = self.sealer_tx.send(SealerInput::Shutdown);
        }

        for worker in &mut self.sealers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("sealer worker {} panicked", worker.id);
                }
            }
        }
    }
}
