use crate::metadata::SectorStateKind;
use crate::sealer::SealerError;
use crate::types::{DealId, SectorNumber};

pub type Result<T> = std::result::Result<T, PieceManagerErr>;

#[derive(Debug, thiserror::Error)]
pub enum PieceManagerErr {
    #[error("sector identity source unavailable: {}", _0)]
    IdentityUnavailable(String),

    #[error("sector identity space exhausted after {}", _0)]
    IdentityExhausted(SectorNumber),

    #[error(
        "number of bytes in piece ({}) exceeds maximum ({})",
        num_bytes_in_piece,
        max_bytes_per_sector
    )]
    PieceTooLarge {
        num_bytes_in_piece: u64,
        max_bytes_per_sector: u64,
    },

    #[error("invalid piece: {}", _0)]
    InvalidPiece(String),

    #[error(
        "failed to read piece: read {} of {} bytes: {}",
        num_bytes_read,
        num_bytes_in_piece,
        reason
    )]
    ReadFailure {
        num_bytes_read: u64,
        num_bytes_in_piece: u64,
        reason: String,
    },

    #[error("deal {} already recorded in sector {}", deal_id, sector_number)]
    DuplicateDeal {
        deal_id: DealId,
        sector_number: SectorNumber,
    },

    #[error("no piece could be found corresponding to deal id: {}", _0)]
    DealNotFound(DealId),

    #[error(
        "no encoded replica exists for sector {} (state: {})",
        sector_number,
        state
    )]
    NotYetEncoded {
        sector_number: SectorNumber,
        state: SectorStateKind,
    },

    #[error("no sector with number {} found", _0)]
    SectorNotFound(SectorNumber),

    #[error("sealing of sector {} failed: {}", sector_number, reason)]
    SealingFailed {
        sector_number: SectorNumber,
        reason: String,
    },

    #[error("sector {} cannot move from {} to {}", sector_number, from, to)]
    InvalidTransition {
        sector_number: SectorNumber,
        from: SectorStateKind,
        to: String,
    },

    #[error("persisted state is corrupt: {}", _0)]
    Corruption(String),

    #[error("invalid configuration: {}", _0)]
    Config(String),

    #[error(transparent)]
    Sealer(#[from] SealerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_cbor::error::Error),

    #[error("piece manager has shut down")]
    ShutDown,
}

pub fn err_overflow(num_bytes_in_piece: u64, max_bytes_per_sector: u64) -> PieceManagerErr {
    PieceManagerErr::PieceTooLarge {
        num_bytes_in_piece,
        max_bytes_per_sector,
    }
}

pub fn err_read(num_bytes_read: u64, num_bytes_in_piece: u64, reason: String) -> PieceManagerErr {
    PieceManagerErr::ReadFailure {
        num_bytes_read,
        num_bytes_in_piece,
        reason,
    }
}

pub fn err_corrupt(msg: String) -> PieceManagerErr {
    PieceManagerErr::Corruption(msg)
}

pub fn err_transition(
    sector_number: SectorNumber,
    from: SectorStateKind,
    to: impl ToString,
) -> PieceManagerErr {
    PieceManagerErr::InvalidTransition {
        sector_number,
        from,
        to: to.to_string(),
    }
}
