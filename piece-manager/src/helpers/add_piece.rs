use std::io::Read;

use crate::error::{err_overflow, PieceManagerErr, Result};
use crate::identity::SectorIdentitySource;
use crate::metadata::{DealInfo, DealLocation, PieceRecord, SectorRecord};
use crate::state::PieceManagerState;
use crate::store::SectorStore;
use crate::types::{SectorNumber, UnpaddedBytesAmount};

/// Where an incoming piece goes.
#[derive(Debug, PartialEq, Eq)]
pub enum Placement {
    /// Append to the open sector.
    Append(SectorNumber),
    /// Close the open sector, if there is one, and open a new one.
    OpenNew { close: Option<SectorNumber> },
}

/// Staged-file length to restore if the mutated state can't be persisted.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct StagedRollback {
    pub sector_number: SectorNumber,
    pub len: u64,
}

#[derive(Debug)]
pub struct AddPieceOutcome {
    pub location: DealLocation,
    /// Sectors which left `Packing` and are ready to start sealing.
    pub closed: Vec<SectorNumber>,
    pub rollback: StagedRollback,
}

pub fn check_piece_size(
    piece_size: UnpaddedBytesAmount,
    capacity: UnpaddedBytesAmount,
) -> Result<()> {
    if piece_size.0 == 0 {
        return Err(PieceManagerErr::InvalidPiece(
            "piece must contain at least one byte".to_string(),
        ));
    }

    if piece_size > capacity {
        return Err(err_overflow(u64::from(piece_size), u64::from(capacity)));
    }

    Ok(())
}

pub fn choose_placement(
    state: &PieceManagerState,
    piece_size: UnpaddedBytesAmount,
    capacity: UnpaddedBytesAmount,
) -> Result<Placement> {
    check_piece_size(piece_size, capacity)?;

    let open = state
        .open_sector
        .and_then(|n| state.sectors.get(&n).map(|record| (n, record)));

    match open {
        Some((n, record)) if record.state.used_capacity() + piece_size <= capacity => {
            Ok(Placement::Append(n))
        }
        Some((n, _)) => Ok(Placement::OpenNew { close: Some(n) }),
        None => Ok(Placement::OpenNew { close: None }),
    }
}

/// Freezes a packing sector's pieces and moves it to the first sealing stage.
pub fn close_sector(state: &mut PieceManagerState, sector_number: SectorNumber) -> Result<()> {
    let record = state
        .sectors
        .get(&sector_number)
        .ok_or(PieceManagerErr::SectorNotFound(sector_number))?
        .begin_sealing()?;

    state.sectors.insert(sector_number, record);

    if state.open_sector == Some(sector_number) {
        state.open_sector = None;
    }

    Ok(())
}

fn open_sector(state: &mut PieceManagerState, ids: &dyn SectorIdentitySource) -> Result<SectorNumber> {
    let sector_number = ids.next()?;

    if state.sectors.contains_key(&sector_number) {
        return Err(PieceManagerErr::Corruption(format!(
            "identity source reissued sector number {}",
            sector_number
        )));
    }

    state
        .sectors
        .insert(sector_number, SectorRecord::new(sector_number));

    info!("allocated sector {}", sector_number);

    Ok(sector_number)
}

/// Places a piece into a sector, writing its bytes to the sector's staged
/// file. Operates on a working copy of the state: callers persist it and, if
/// that fails, truncate the staged file per the returned rollback.
pub fn add_piece<S: SectorStore + ?Sized>(
    store: &S,
    ids: &dyn SectorIdentitySource,
    state: &mut PieceManagerState,
    deal_info: DealInfo,
    piece_size: UnpaddedBytesAmount,
    piece_file: &mut dyn Read,
) -> Result<AddPieceOutcome> {
    let capacity = store.sector_capacity();
    let mut closed = vec![];

    let sector_number = match choose_placement(state, piece_size, capacity)? {
        Placement::Append(n) => n,
        Placement::OpenNew { close } => {
            // obtain the new number first so that a failure leaves the open
            // sector untouched
            let n = open_sector(state, ids)?;

            if let Some(c) = close {
                close_sector(state, c)?;
                closed.push(c);
            }

            state.open_sector = Some(n);
            n
        }
    };

    let prior_len = store.staged_len(sector_number)?.unwrap_or(0);

    let record = state
        .sectors
        .get_mut(&sector_number)
        .ok_or(PieceManagerErr::SectorNotFound(sector_number))?;

    let offset = record.append_piece(
        PieceRecord {
            piece_size,
            deal_info: Some(deal_info),
        },
        capacity,
    )?;

    let is_full = record.state.used_capacity() == capacity;

    store.append_piece(sector_number, piece_file, piece_size)?;

    if is_full {
        close_sector(state, sector_number)?;
        closed.push(sector_number);
    }

    Ok(AddPieceOutcome {
        location: DealLocation {
            sector_number,
            offset,
            size: piece_size,
        },
        closed,
        rollback: StagedRollback {
            sector_number,
            len: prior_len,
        },
    })
}

/// Allocates a committed-capacity sector filled with a single deal-less
/// piece, ready to start sealing. The open sector is not affected.
pub fn pledge_sector<S: SectorStore + ?Sized>(
    store: &S,
    ids: &dyn SectorIdentitySource,
    state: &mut PieceManagerState,
) -> Result<SectorNumber> {
    let capacity = store.sector_capacity();
    let sector_number = open_sector(state, ids)?;

    let record = state
        .sectors
        .get_mut(&sector_number)
        .ok_or(PieceManagerErr::SectorNotFound(sector_number))?;

    record.append_piece(
        PieceRecord {
            piece_size: capacity,
            deal_info: None,
        },
        capacity,
    )?;

    store.write_filler(sector_number, capacity)?;
    close_sector(state, sector_number)?;

    Ok(sector_number)
}
