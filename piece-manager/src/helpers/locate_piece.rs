use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;

use crate::error::{err_corrupt, PieceManagerErr, Result};
use crate::metadata::{DealLocation, SectorRecord};
use crate::types::{DealId, SectorNumber, UnpaddedByteIndex};

pub type DealIndex = HashMap<DealId, DealLocation>;

/// Every deal piece in the sector, with offsets accumulated in append order.
pub fn piece_locations(record: &SectorRecord) -> Vec<(DealId, DealLocation)> {
    let mut offset = UnpaddedByteIndex(0);
    let mut locations = vec![];

    for piece in record.pieces() {
        if let Some(deal_id) = piece.deal_id() {
            locations.push((
                deal_id,
                DealLocation {
                    sector_number: record.sector_number,
                    offset,
                    size: piece.piece_size,
                },
            ));
        }

        offset = offset + piece.piece_size;
    }

    locations
}

pub fn build_deal_index(sectors: &BTreeMap<SectorNumber, SectorRecord>) -> Result<DealIndex> {
    let locations: Vec<(DealId, DealLocation)> = sectors
        .par_iter()
        .flat_map(|(_, record)| piece_locations(record))
        .collect();

    let mut index = DealIndex::with_capacity(locations.len());

    for (deal_id, location) in locations {
        if let Some(existing) = index.insert(deal_id, location) {
            return Err(err_corrupt(format!(
                "deal {} recorded in sectors {} and {}",
                deal_id, existing.sector_number, location.sector_number
            )));
        }
    }

    Ok(index)
}

/// Resolves a deal to its location, provided its sector holds an encoded
/// replica.
pub fn locate_piece(
    index: &DealIndex,
    sectors: &BTreeMap<SectorNumber, SectorRecord>,
    deal_id: DealId,
) -> Result<DealLocation> {
    let location = index
        .get(&deal_id)
        .ok_or(PieceManagerErr::DealNotFound(deal_id))?;

    let record = sectors
        .get(&location.sector_number)
        .ok_or_else(|| err_corrupt(format!("deal {} indexed to unknown sector", deal_id)))?;

    if !record.state.is_encoded() {
        return Err(PieceManagerErr::NotYetEncoded {
            sector_number: record.sector_number,
            state: record.kind(),
        });
    }

    Ok(*location)
}
