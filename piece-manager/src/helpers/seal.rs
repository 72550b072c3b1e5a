use crate::error::{PieceManagerErr, Result};
use crate::metadata::{SectorRecord, SectorState};
use crate::sealer::{StageTask, UnsealTask};
use crate::store::SectorStore;
use crate::types::{UnpaddedByteIndex, UnpaddedBytesAmount};

/// The task for the stage a sealing sector is currently in. `None` for
/// sectors that are not sealing.
pub fn stage_task<S: SectorStore + ?Sized>(store: &S, record: &SectorRecord) -> Option<StageTask> {
    match &record.state {
        SectorState::Sealing {
            stage,
            pieces,
            outputs,
        } => Some(StageTask {
            sector_number: record.sector_number,
            stage: *stage,
            pieces: pieces.clone(),
            staged_sector_path: store.staged_sector_path(record.sector_number),
            sealed_sector_path: store.sealed_sector_path(record.sector_number),
            previous_outputs: outputs.clone(),
        }),
        _ => None,
    }
}

/// Builds an unseal task for a byte range of an encoded sector. `range`
/// defaults to the whole of the sector's piece data.
pub fn unseal_task<S: SectorStore + ?Sized>(
    store: &S,
    record: &SectorRecord,
    range: Option<(UnpaddedByteIndex, UnpaddedBytesAmount)>,
) -> Result<UnsealTask> {
    if let SectorState::Failed { reason, .. } = &record.state {
        return Err(PieceManagerErr::SealingFailed {
            sector_number: record.sector_number,
            reason: reason.clone(),
        });
    }

    if !record.state.is_encoded() {
        return Err(PieceManagerErr::NotYetEncoded {
            sector_number: record.sector_number,
            state: record.kind(),
        });
    }

    let (start, len) =
        range.unwrap_or_else(|| (UnpaddedByteIndex(0), record.state.used_capacity()));

    Ok(UnsealTask {
        sector_number: record.sector_number,
        pieces: record.pieces().to_vec(),
        staged_sector_path: store.staged_sector_path(record.sector_number),
        sealed_sector_path: store.sealed_sector_path(record.sector_number),
        outputs: record.state.outputs().to_vec(),
        start,
        len,
    })
}
