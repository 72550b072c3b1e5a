use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::constants::SECTOR_ID_COUNTER_KEY;
use crate::error::{PieceManagerErr, Result};
use crate::kv_store::KeyValueStore;
use crate::types::{MinerId, SectorNumber};

/// Issues sector numbers. A number handed out once is never handed out again,
/// including after a restart.
pub trait SectorIdentitySource: Send {
    fn next(&self) -> Result<SectorNumber>;
}

/// Counter persisted in a `KeyValueStore`. The incremented value is durable
/// before it is returned.
pub struct PersistentSectorIdCounter<T: KeyValueStore> {
    kv_store: Arc<T>,
    key: Vec<u8>,
    last_issued: Mutex<SectorNumber>,
}

impl<T: KeyValueStore> PersistentSectorIdCounter<T> {
    /// Loads the counter. `floor` is the highest number known to be in use
    /// elsewhere (e.g. already committed on chain); issued numbers always
    /// exceed it.
    pub fn initialize(
        kv_store: Arc<T>,
        miner_id: MinerId,
        floor: SectorNumber,
    ) -> Result<PersistentSectorIdCounter<T>> {
        let mut key = SECTOR_ID_COUNTER_KEY.to_vec();
        key.extend_from_slice(&miner_id.to_le_bytes());

        let stored = kv_store
            .get(&key)
            .map_err(|err| PieceManagerErr::IdentityUnavailable(err.to_string()))?;

        let persisted = match stored {
            Some(bytes) if bytes.len() == 8 => LittleEndian::read_u64(&bytes),
            Some(bytes) => {
                return Err(PieceManagerErr::Corruption(format!(
                    "sector id counter has {} bytes, expected 8",
                    bytes.len()
                )))
            }
            None => 0,
        };

        Ok(PersistentSectorIdCounter {
            kv_store,
            key,
            last_issued: Mutex::new(persisted.max(floor)),
        })
    }
}

impl<T: KeyValueStore> SectorIdentitySource for PersistentSectorIdCounter<T> {
    fn next(&self) -> Result<SectorNumber> {
        let mut last_issued = self
            .last_issued
            .lock()
            .map_err(|_| PieceManagerErr::IdentityUnavailable("counter lock poisoned".into()))?;

        let next = last_issued
            .checked_add(1)
            .ok_or(PieceManagerErr::IdentityExhausted(*last_issued))?;

        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, next);

        self.kv_store
            .put(&self.key, &buf)
            .map_err(|err| PieceManagerErr::IdentityUnavailable(err.to_string()))?;

        *last_issued = next;

        Ok(next)
    }
}
