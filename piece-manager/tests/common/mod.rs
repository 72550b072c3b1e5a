#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use piece_manager::{
    DealId, DealLocation, PaddedBytesAmount, PieceManager, PieceManagerConfig, Sealer,
    SealerError, SealingStage, SectorEvent, SectorNumber, SectorPieceManager, SectorStateKind,
    StageOutput, StageTask, UnpaddedByteIndex, UnpaddedBytesAmount, UnsealTask,
};

/// Holds 8128 bytes of piece data.
pub const SECTOR_SIZE: PaddedBytesAmount = PaddedBytesAmount(8192);

pub const MINER_ID: u64 = 1000;

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

pub struct Harness {
    pub dir: TempDir,
    pub config: PieceManagerConfig,
}

impl Harness {
    pub fn new() -> Harness {
        init_logger();

        let dir = tempfile::tempdir().unwrap();
        let config = PieceManagerConfig::with_root(dir.path(), MINER_ID, SECTOR_SIZE);

        Harness { dir, config }
    }

    pub fn start(&self, sealer: Arc<dyn Sealer>) -> SectorPieceManager {
        SectorPieceManager::init_from_config(&self.config, sealer).unwrap()
    }

    pub fn start_immediate(&self) -> SectorPieceManager {
        self.start(Arc::new(ImmediateSealer))
    }
}

pub fn dir_entries<P: AsRef<Path>>(dir: P) -> usize {
    fs::read_dir(dir).unwrap().count()
}

/// Deterministic piece contents, different for every deal.
pub fn piece_bytes(deal_id: DealId, len: u64) -> Vec<u8> {
    (0..len)
        .map(|i| (deal_id as u8).wrapping_mul(31).wrapping_add(i as u8))
        .collect()
}

pub fn add_deal(m: &SectorPieceManager, deal_id: DealId, len: u64) -> DealLocation {
    m.seal_piece_into_new_sector(
        deal_id,
        100,
        200,
        UnpaddedBytesAmount(len),
        &mut Cursor::new(piece_bytes(deal_id, len)),
    )
    .unwrap()
}

pub fn wait_for_status(m: &SectorPieceManager, sector_number: SectorNumber, want: SectorStateKind) {
    let deadline = Instant::now() + WAIT_TIMEOUT;

    loop {
        let status = m.get_seal_status(sector_number).unwrap();
        if status == want {
            return;
        }

        assert!(
            status != SectorStateKind::Failed,
            "sector {} failed while waiting for {:?}",
            sector_number,
            want
        );
        assert!(
            Instant::now() < deadline,
            "sector {} stuck in {:?} waiting for {:?}",
            sector_number,
            status,
            want
        );

        thread::sleep(Duration::from_millis(10));
    }
}

pub fn wait_for_event(
    rx: &mpsc::Receiver<SectorEvent>,
    sector_number: SectorNumber,
    want: SectorStateKind,
) -> SectorEvent {
    loop {
        let event = rx
            .recv_timeout(WAIT_TIMEOUT)
            .expect("timed out waiting for sector event");

        if event.sector_number == sector_number && event.state == want {
            return event;
        }
    }
}

fn copy_range(
    path: &Path,
    start: UnpaddedByteIndex,
    len: UnpaddedBytesAmount,
    destination: &mut dyn Write,
) -> io::Result<u64> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start.0))?;
    io::copy(&mut file.take(len.0), destination)
}

/// Seals by copying the staged file; every stage succeeds at once.
pub struct ImmediateSealer;

impl Sealer for ImmediateSealer {
    fn run_stage(&self, task: &StageTask) -> Result<StageOutput, SealerError> {
        if task.stage == SealingStage::PreCommit1 {
            fs::copy(&task.staged_sector_path, &task.sealed_sector_path)
                .map_err(|err| SealerError::Fatal(err.to_string()))?;
        }

        Ok(StageOutput(vec![task.stage.index() as u8]))
    }

    fn unseal(
        &self,
        task: &UnsealTask,
        destination: &mut dyn Write,
    ) -> Result<UnpaddedBytesAmount, SealerError> {
        copy_range(&task.sealed_sector_path, task.start, task.len, destination)
            .map(UnpaddedBytesAmount)
            .map_err(|err| SealerError::Fatal(err.to_string()))
    }
}

/// Blocks at one stage until the returned sender sends or is dropped.
pub struct GatedSealer {
    stage: SealingStage,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl GatedSealer {
    pub fn new(stage: SealingStage) -> (Arc<GatedSealer>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();

        let sealer = GatedSealer {
            stage,
            gate: Mutex::new(rx),
        };

        (Arc::new(sealer), tx)
    }
}

impl Sealer for GatedSealer {
    fn run_stage(&self, task: &StageTask) -> Result<StageOutput, SealerError> {
        if task.stage == self.stage {
            let _ = self.gate.lock().unwrap().recv();
        }

        ImmediateSealer.run_stage(task)
    }

    fn unseal(
        &self,
        task: &UnsealTask,
        destination: &mut dyn Write,
    ) -> Result<UnpaddedBytesAmount, SealerError> {
        ImmediateSealer.unseal(task, destination)
    }
}

/// Fails one stage with queued errors, then lets it succeed.
pub struct ScriptedSealer {
    stage: SealingStage,
    errors: Mutex<VecDeque<SealerError>>,
    attempts: AtomicUsize,
}

impl ScriptedSealer {
    pub fn new(stage: SealingStage, errors: Vec<SealerError>) -> Arc<ScriptedSealer> {
        Arc::new(ScriptedSealer {
            stage,
            errors: Mutex::new(errors.into_iter().collect()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Sealer for ScriptedSealer {
    fn run_stage(&self, task: &StageTask) -> Result<StageOutput, SealerError> {
        if task.stage == self.stage {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            if let Some(err) = self.errors.lock().unwrap().pop_front() {
                return Err(err);
            }
        }

        ImmediateSealer.run_stage(task)
    }

    fn unseal(
        &self,
        task: &UnsealTask,
        destination: &mut dyn Write,
    ) -> Result<UnpaddedBytesAmount, SealerError> {
        ImmediateSealer.unseal(task, destination)
    }
}

/// Yields some bytes, then fails as a cancelled transfer would.
pub struct InterruptedReader {
    remaining: usize,
}

impl InterruptedReader {
    pub fn new(bytes_before_failure: usize) -> InterruptedReader {
        InterruptedReader {
            remaining: bytes_before_failure,
        }
    }
}

impl Read for InterruptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "transfer cancelled"));
        }

        let n = self.remaining.min(buf.len());
        for b in buf[..n].iter_mut() {
            *b = 7;
        }
        self.remaining -= n;

        Ok(n)
    }
}
