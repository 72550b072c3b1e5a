use std::io::Read;

use crate::error::Result;
use crate::metadata::DealLocation;
use crate::sealer::UnsealedStream;
use crate::types::{ChainEpoch, DealId, SectorNumber, UnpaddedBytesAmount};

pub trait PieceManager {
    // Reads exactly `piece_size` bytes from `piece_reader` and packs them into
    // a sector for sealing. Returns where the piece landed. Either the piece
    // is durably recorded or nothing is.
    fn seal_piece_into_new_sector(
        &self,
        deal_id: DealId,
        deal_start: ChainEpoch,
        deal_end: ChainEpoch,
        piece_size: UnpaddedBytesAmount,
        piece_reader: &mut dyn Read,
    ) -> Result<DealLocation>;

    // Seals a sector holding no deal data (committed capacity).
    fn pledge_sector(&self) -> Result<SectorNumber>;

    // Streams the unsealed piece data of an encoded sector. Dropping the
    // stream releases everything backing it.
    fn unseal_sector(&self, sector_number: SectorNumber) -> Result<UnsealedStream>;

    // Returns the sector, offset and size of the deal's piece. Fails with
    // `NotYetEncoded` if the sector has no encoded replica yet and with
    // `DealNotFound` if no sector holds the deal.
    fn locate_piece_for_deal_within_sector(&self, deal_id: DealId) -> Result<DealLocation>;
}
