use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::constants::SNAPSHOT_KEY_PREFIX;
use crate::error::Result;
use crate::kv_store::KeyValueStore;
use crate::state::*;
use crate::types::{MinerId, PaddedBytesAmount};

#[derive(Clone)]
pub struct SnapshotKey {
    miner_id: MinerId,
    sector_size: PaddedBytesAmount,
}

impl SnapshotKey {
    pub fn new(miner_id: MinerId, sector_size: PaddedBytesAmount) -> SnapshotKey {
        SnapshotKey {
            miner_id,
            sector_size,
        }
    }
}

pub fn load_snapshot<T: KeyValueStore>(
    kv_store: &Arc<T>,
    key: &SnapshotKey,
) -> Result<Option<StateSnapshot>> {
    let result: Option<Vec<u8>> = kv_store.get(&Vec::from(key))?;

    if let Some(val) = result {
        return Ok(Some(serde_cbor::from_slice(&val[..])?));
    }

    Ok(None)
}

impl From<&SnapshotKey> for Vec<u8> {
    fn from(n: &SnapshotKey) -> Self {
        let mut snapshot_key = SNAPSHOT_KEY_PREFIX.to_vec();

        // writes into a Vec can't fail
        let _ = snapshot_key.write_u64::<LittleEndian>(u64::from(n.sector_size));
        let _ = snapshot_key.write_u64::<LittleEndian>(n.miner_id);

        snapshot_key
    }
}

pub fn persist_snapshot<T: KeyValueStore>(
    kv_store: &Arc<T>,
    key: &SnapshotKey,
    snapshot: &StateSnapshot,
) -> Result<()> {
    let serialized = serde_cbor::to_vec(snapshot)?;
    kv_store.put(&Vec::from(key), &serialized)?;
    Ok(())
}

pub fn make_snapshot(state: &PieceManagerState) -> StateSnapshot {
    StateSnapshot {
        sectors: state.sectors.clone(),
        open_sector: state.open_sector,
        replicas: state.replicas.clone(),
    }
}
