use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{err_overflow, err_transition, PieceManagerErr, Result};
use crate::types::{
    ChainEpoch, DealId, SectorNumber, UnpaddedByteIndex, UnpaddedBytesAmount,
};

/// The epoch interval for which a deal's data must remain provably stored.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct DealSchedule {
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
}

impl DealSchedule {
    pub fn new(start_epoch: ChainEpoch, end_epoch: ChainEpoch) -> Result<DealSchedule> {
        if start_epoch >= end_epoch {
            return Err(PieceManagerErr::InvalidPiece(format!(
                "deal must start before it ends (start: {}, end: {})",
                start_epoch, end_epoch
            )));
        }

        Ok(DealSchedule {
            start_epoch,
            end_epoch,
        })
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct DealInfo {
    pub deal_id: DealId,
    pub deal_schedule: DealSchedule,
}

/// A piece packed into a sector. Pledge (committed capacity) pieces carry no
/// deal.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PieceRecord {
    pub piece_size: UnpaddedBytesAmount,
    pub deal_info: Option<DealInfo>,
}

impl PieceRecord {
    pub fn deal_id(&self) -> Option<DealId> {
        self.deal_info.map(|d| d.deal_id)
    }
}

/// Opaque result of one sealing stage, handed to every later stage.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct StageOutput(pub Vec<u8>);

/// The stages a sector passes through between packing and proving, in order.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum SealingStage {
    PreCommit1,
    PreCommit2,
    PreCommitting,
    WaitSeed,
    Committing,
    CommitWait,
    FinalizeSector,
}

impl SealingStage {
    pub const ALL: [SealingStage; 7] = [
        SealingStage::PreCommit1,
        SealingStage::PreCommit2,
        SealingStage::PreCommitting,
        SealingStage::WaitSeed,
        SealingStage::Committing,
        SealingStage::CommitWait,
        SealingStage::FinalizeSector,
    ];

    /// Position in the pipeline; also the number of stage outputs a sector in
    /// this stage has accumulated.
    pub fn index(self) -> usize {
        match self {
            SealingStage::PreCommit1 => 0,
            SealingStage::PreCommit2 => 1,
            SealingStage::PreCommitting => 2,
            SealingStage::WaitSeed => 3,
            SealingStage::Committing => 4,
            SealingStage::CommitWait => 5,
            SealingStage::FinalizeSector => 6,
        }
    }

    /// The stage that follows this one, or `None` if the sector proves next.
    pub fn next(self) -> Option<SealingStage> {
        SealingStage::ALL.get(self.index() + 1).copied()
    }
}

/// Flat view of a sector's lifecycle state, for status reporting.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum SectorStateKind {
    Packing,
    PreCommit1,
    PreCommit2,
    PreCommitting,
    WaitSeed,
    Committing,
    CommitWait,
    FinalizeSector,
    Proving,
    Failed,
}

impl SectorStateKind {
    /// Piece data is cryptographically committed and addressable for
    /// retrieval.
    pub fn is_encoded(self) -> bool {
        match self {
            SectorStateKind::PreCommit2
            | SectorStateKind::PreCommitting
            | SectorStateKind::WaitSeed
            | SectorStateKind::Committing
            | SectorStateKind::CommitWait
            | SectorStateKind::FinalizeSector
            | SectorStateKind::Proving => true,
            SectorStateKind::Packing | SectorStateKind::PreCommit1 | SectorStateKind::Failed => {
                false
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            SectorStateKind::Proving | SectorStateKind::Failed => true,
            _ => false,
        }
    }
}

impl From<SealingStage> for SectorStateKind {
    fn from(stage: SealingStage) -> Self {
        match stage {
            SealingStage::PreCommit1 => SectorStateKind::PreCommit1,
            SealingStage::PreCommit2 => SectorStateKind::PreCommit2,
            SealingStage::PreCommitting => SectorStateKind::PreCommitting,
            SealingStage::WaitSeed => SectorStateKind::WaitSeed,
            SealingStage::Committing => SectorStateKind::Committing,
            SealingStage::CommitWait => SectorStateKind::CommitWait,
            SealingStage::FinalizeSector => SectorStateKind::FinalizeSector,
        }
    }
}

impl fmt::Display for SectorStateKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A sector's lifecycle state. Each variant carries only what is valid for it:
/// pieces can be appended only while `Packing`, stage outputs exist only once
/// sealing has begun.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum SectorState {
    Packing {
        pieces: Vec<PieceRecord>,
    },
    Sealing {
        stage: SealingStage,
        pieces: Vec<PieceRecord>,
        outputs: Vec<StageOutput>,
    },
    Proving {
        pieces: Vec<PieceRecord>,
        outputs: Vec<StageOutput>,
    },
    Failed {
        pieces: Vec<PieceRecord>,
        failed_in: SectorStateKind,
        reason: String,
    },
}

impl Default for SectorState {
    fn default() -> Self {
        SectorState::Packing { pieces: vec![] }
    }
}

impl SectorState {
    pub fn kind(&self) -> SectorStateKind {
        match self {
            SectorState::Packing { .. } => SectorStateKind::Packing,
            SectorState::Sealing { stage, .. } => SectorStateKind::from(*stage),
            SectorState::Proving { .. } => SectorStateKind::Proving,
            SectorState::Failed { .. } => SectorStateKind::Failed,
        }
    }

    pub fn pieces(&self) -> &[PieceRecord] {
        match self {
            SectorState::Packing { pieces }
            | SectorState::Sealing { pieces, .. }
            | SectorState::Proving { pieces, .. }
            | SectorState::Failed { pieces, .. } => pieces,
        }
    }

    pub fn outputs(&self) -> &[StageOutput] {
        match self {
            SectorState::Sealing { outputs, .. } | SectorState::Proving { outputs, .. } => outputs,
            SectorState::Packing { .. } | SectorState::Failed { .. } => &[],
        }
    }

    pub fn is_encoded(&self) -> bool {
        self.kind().is_encoded()
    }

    pub fn used_capacity(&self) -> UnpaddedBytesAmount {
        self.pieces()
            .iter()
            .fold(UnpaddedBytesAmount(0), |acc, p| acc + p.piece_size)
    }
}

/// One sector and its lifecycle state. Records are never deleted.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SectorRecord {
    pub sector_number: SectorNumber,
    pub state: SectorState,
}

impl SectorRecord {
    pub fn new(sector_number: SectorNumber) -> SectorRecord {
        SectorRecord {
            sector_number,
            state: Default::default(),
        }
    }

    pub fn kind(&self) -> SectorStateKind {
        self.state.kind()
    }

    pub fn pieces(&self) -> &[PieceRecord] {
        self.state.pieces()
    }

    /// Appends a piece to a packing sector, returning the byte offset at
    /// which it starts.
    pub fn append_piece(
        &mut self,
        piece: PieceRecord,
        capacity: UnpaddedBytesAmount,
    ) -> Result<UnpaddedByteIndex> {
        let sector_number = self.sector_number;
        let from = self.kind();
        let used = self.state.used_capacity();

        match &mut self.state {
            SectorState::Packing { pieces } => {
                if used + piece.piece_size > capacity {
                    return Err(err_overflow(
                        u64::from(piece.piece_size),
                        u64::from(capacity - used),
                    ));
                }

                pieces.push(piece);

                Ok(UnpaddedByteIndex::from(used))
            }
            _ => Err(err_transition(sector_number, from, "Packing (append piece)")),
        }
    }

    /// Packing -> PreCommit1. The piece list is frozen from here on.
    pub fn begin_sealing(&self) -> Result<SectorRecord> {
        match &self.state {
            SectorState::Packing { pieces } => Ok(self.with_state(SectorState::Sealing {
                stage: SealingStage::PreCommit1,
                pieces: pieces.clone(),
                outputs: vec![],
            })),
            _ => Err(err_transition(
                self.sector_number,
                self.kind(),
                SectorStateKind::PreCommit1,
            )),
        }
    }

    /// Records completion of `completed` and moves to the stage after it, or
    /// to `Proving` once the sector has been finalized.
    pub fn advance(&self, completed: SealingStage, output: StageOutput) -> Result<SectorRecord> {
        match &self.state {
            SectorState::Sealing {
                stage,
                pieces,
                outputs,
            } if *stage == completed => {
                let mut outputs = outputs.clone();
                outputs.push(output);

                let next = match stage.next() {
                    Some(next) => SectorState::Sealing {
                        stage: next,
                        pieces: pieces.clone(),
                        outputs,
                    },
                    None => SectorState::Proving {
                        pieces: pieces.clone(),
                        outputs,
                    },
                };

                Ok(self.with_state(next))
            }
            _ => Err(err_transition(
                self.sector_number,
                self.kind(),
                format!("after {:?}", completed),
            )),
        }
    }

    /// Moves a non-terminal sector to `Failed`. Failure is permanent.
    pub fn fail(&self, reason: String) -> Result<SectorRecord> {
        let failed_in = self.kind();

        if failed_in.is_terminal() {
            return Err(err_transition(
                self.sector_number,
                failed_in,
                SectorStateKind::Failed,
            ));
        }

        Ok(self.with_state(SectorState::Failed {
            pieces: self.pieces().to_vec(),
            failed_in,
            reason,
        }))
    }

    fn with_state(&self, state: SectorState) -> SectorRecord {
        SectorRecord {
            sector_number: self.sector_number,
            state,
        }
    }
}

/// Where a deal's piece lives within its sector.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct DealLocation {
    pub sector_number: SectorNumber,
    pub offset: UnpaddedByteIndex,
    pub size: UnpaddedBytesAmount,
}

/// Published for every persisted lifecycle transition.
#[derive(Clone, Debug, PartialEq)]
pub struct SectorEvent {
    pub sector_number: SectorNumber,
    pub state: SectorStateKind,
    pub reason: Option<String>,
}

impl From<&SectorRecord> for SectorEvent {
    fn from(record: &SectorRecord) -> Self {
        let reason = match &record.state {
            SectorState::Failed { reason, .. } => Some(reason.clone()),
            _ => None,
        };

        SectorEvent {
            sector_number: record.sector_number,
            state: record.kind(),
            reason,
        }
    }
}

/// Recorded when a sector starts proving, so that later health checks can
/// detect a replica that went missing or changed on disk.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SealedReplica {
    pub sector_access: String,
    pub len: u64,
    pub blake2b_checksum: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SealedSectorHealth {
    Ok,
    ErrorInvalidChecksum,
    ErrorInvalidLength,
    ErrorMissing,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProvingSectorMetadata {
    pub sector_number: SectorNumber,
    pub pieces: Vec<PieceRecord>,
    pub replica: Option<SealedReplica>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GetProvingSectorResult {
    WithHealth(SealedSectorHealth, ProvingSectorMetadata),
    WithoutHealth(ProvingSectorMetadata),
}
