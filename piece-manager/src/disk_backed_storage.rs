use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{err_read, Result};
use crate::store::SectorStore;
use crate::types::{PaddedBytesAmount, SectorNumber, UnpaddedBytesAmount};

pub struct DiskSectorStore {
    staged_sector_dir: PathBuf,
    sealed_sector_dir: PathBuf,
    unsealed_sector_dir: PathBuf,
    sector_size: PaddedBytesAmount,
}

impl DiskSectorStore {
    pub fn new<P: AsRef<Path>>(
        staged_sector_dir: P,
        sealed_sector_dir: P,
        unsealed_sector_dir: P,
        sector_size: PaddedBytesAmount,
    ) -> Result<DiskSectorStore> {
        for dir in &[&staged_sector_dir, &sealed_sector_dir, &unsealed_sector_dir] {
            fs::create_dir_all(dir)?;
        }

        Ok(DiskSectorStore {
            staged_sector_dir: staged_sector_dir.as_ref().to_path_buf(),
            sealed_sector_dir: sealed_sector_dir.as_ref().to_path_buf(),
            unsealed_sector_dir: unsealed_sector_dir.as_ref().to_path_buf(),
            sector_size,
        })
    }

    fn open_for_append(&self, sector_number: SectorNumber) -> Result<(File, u64)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.staged_sector_path(sector_number))?;

        let len = file.metadata()?.len();

        Ok((file, len))
    }
}

impl SectorStore for DiskSectorStore {
    fn sector_capacity(&self) -> UnpaddedBytesAmount {
        UnpaddedBytesAmount::from(self.sector_size)
    }

    fn staged_sector_path(&self, sector_number: SectorNumber) -> PathBuf {
        self.staged_sector_dir.join(format!("on-{}", sector_number))
    }

    fn sealed_sector_path(&self, sector_number: SectorNumber) -> PathBuf {
        self.sealed_sector_dir.join(format!("on-{}", sector_number))
    }

    fn new_incoming_piece_file(&self) -> Result<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&self.staged_sector_dir)?)
    }

    fn new_unsealed_file(&self) -> Result<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix("unsealed-")
            .tempfile_in(&self.unsealed_sector_dir)?)
    }

    fn staged_len(&self, sector_number: SectorNumber) -> Result<Option<u64>> {
        match fs::metadata(self.staged_sector_path(sector_number)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn append_piece(
        &self,
        sector_number: SectorNumber,
        piece: &mut dyn Read,
        len: UnpaddedBytesAmount,
    ) -> Result<()> {
        let (mut file, start) = self.open_for_append(sector_number)?;

        let written = io::copy(&mut piece.take(u64::from(len)), &mut file)
            .and_then(|n| file.sync_data().map(|_| n));

        match written {
            Ok(n) if n == u64::from(len) => Ok(()),
            Ok(n) => {
                file.set_len(start)?;
                Err(err_read(
                    n,
                    u64::from(len),
                    "piece ended early".to_string(),
                ))
            }
            Err(err) => {
                file.set_len(start)?;
                Err(err.into())
            }
        }
    }

    fn write_filler(&self, sector_number: SectorNumber, len: UnpaddedBytesAmount) -> Result<()> {
        self.append_piece(sector_number, &mut io::repeat(0), len)
    }

    fn truncate_staged(&self, sector_number: SectorNumber, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.staged_sector_path(sector_number))?;
        file.set_len(len)?;
        file.sync_data()?;

        Ok(())
    }
}
