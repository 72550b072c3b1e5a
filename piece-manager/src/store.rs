use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::error::Result;
use crate::types::{SectorNumber, UnpaddedBytesAmount};

/// Where sector bytes live while they are packed, sealed and unsealed.
pub trait SectorStore: Send + Sync {
    /// Maximum number of unpadded bytes a sector holds.
    fn sector_capacity(&self) -> UnpaddedBytesAmount;

    fn staged_sector_path(&self, sector_number: SectorNumber) -> PathBuf;

    fn sealed_sector_path(&self, sector_number: SectorNumber) -> PathBuf;

    /// A fresh temporary file for incoming piece bytes, removed when dropped.
    fn new_incoming_piece_file(&self) -> Result<NamedTempFile>;

    /// A fresh temporary file for unsealed output, removed when dropped.
    fn new_unsealed_file(&self) -> Result<NamedTempFile>;

    /// Current length of the staged sector file, `None` if it doesn't exist.
    fn staged_len(&self, sector_number: SectorNumber) -> Result<Option<u64>>;

    /// Appends exactly `len` bytes from `piece` to the staged sector file. On
    /// any error the file is restored to its previous length.
    fn append_piece(
        &self,
        sector_number: SectorNumber,
        piece: &mut dyn std::io::Read,
        len: UnpaddedBytesAmount,
    ) -> Result<()>;

    /// Appends `len` zero bytes, used for committed-capacity sectors.
    fn write_filler(&self, sector_number: SectorNumber, len: UnpaddedBytesAmount) -> Result<()>;

    fn truncate_staged(&self, sector_number: SectorNumber, len: u64) -> Result<()>;
}
