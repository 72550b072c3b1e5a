use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::metadata::{SealedReplica, SectorRecord};
use crate::types::SectorNumber;

#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct PieceManagerState {
    pub sectors: BTreeMap<SectorNumber, SectorRecord>,
    /// The single sector currently accepting pieces, if any.
    pub open_sector: Option<SectorNumber>,
    pub replicas: HashMap<SectorNumber, SealedReplica>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct StateSnapshot {
    pub sectors: BTreeMap<SectorNumber, SectorRecord>,
    pub open_sector: Option<SectorNumber>,
    pub replicas: HashMap<SectorNumber, SealedReplica>,
}

impl From<StateSnapshot> for PieceManagerState {
    fn from(snapshot: StateSnapshot) -> Self {
        PieceManagerState {
            sectors: snapshot.sectors,
            open_sector: snapshot.open_sector,
            replicas: snapshot.replicas,
        }
    }
}
