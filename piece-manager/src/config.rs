use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MAX_STAGE_RETRIES, DEFAULT_NUM_WORKERS};
use crate::error::{PieceManagerErr, Result};
use crate::types::{MinerId, PaddedBytesAmount, SectorNumber, UnpaddedBytesAmount};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceManagerConfig {
    pub metadata_dir: PathBuf,
    pub staged_sector_dir: PathBuf,
    pub sealed_sector_dir: PathBuf,
    pub unsealed_sector_dir: PathBuf,
    pub sector_size: PaddedBytesAmount,
    pub miner_id: MinerId,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Transient failures tolerated per stage before a sector is failed.
    #[serde(default = "default_max_stage_retries")]
    pub max_stage_retries: u32,
    /// Highest sector number already in use outside this store.
    #[serde(default)]
    pub last_committed_sector_number: SectorNumber,
}

fn default_num_workers() -> usize {
    DEFAULT_NUM_WORKERS
}

fn default_max_stage_retries() -> u32 {
    DEFAULT_MAX_STAGE_RETRIES
}

impl PieceManagerConfig {
    /// All directories placed under `root`, with default tuning.
    pub fn with_root<P: AsRef<Path>>(
        root: P,
        miner_id: MinerId,
        sector_size: PaddedBytesAmount,
    ) -> PieceManagerConfig {
        let root = root.as_ref();

        PieceManagerConfig {
            metadata_dir: root.join("metadata"),
            staged_sector_dir: root.join("staged"),
            sealed_sector_dir: root.join("sealed"),
            unsealed_sector_dir: root.join("unsealed"),
            sector_size,
            miner_id,
            num_workers: DEFAULT_NUM_WORKERS,
            max_stage_retries: DEFAULT_MAX_STAGE_RETRIES,
            last_committed_sector_number: 0,
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<PieceManagerConfig> {
        let file = File::open(path.as_ref())?;

        let config: PieceManagerConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| {
                PieceManagerErr::Config(format!("{}: {}", path.as_ref().display(), err))
            })?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if UnpaddedBytesAmount::from(self.sector_size).0 == 0 {
            return Err(PieceManagerErr::Config(format!(
                "sector size {} holds no data",
                self.sector_size
            )));
        }

        if self.num_workers == 0 {
            return Err(PieceManagerErr::Config(
                "at least one sealing worker is required".to_string(),
            ));
        }

        Ok(())
    }
}
