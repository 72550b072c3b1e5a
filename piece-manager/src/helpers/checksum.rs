use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use blake2b_simd::State;
use rayon::prelude::*;

use crate::error::Result;
use crate::metadata::{
    GetProvingSectorResult, ProvingSectorMetadata, SealedReplica, SealedSectorHealth,
};

const BUFFER_SIZE: usize = 1 << 16;

pub fn calculate_checksum<T: AsRef<Path>>(path: T) -> Result<blake2b_simd::Hash> {
    let mut file = File::open(path)?;
    let mut hasher = State::new();
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

/// Records length and checksum of a freshly sealed replica.
pub fn describe_replica<T: AsRef<Path>>(path: T) -> Result<SealedReplica> {
    let len = std::fs::metadata(path.as_ref())?.len();
    let checksum = calculate_checksum(path.as_ref())?;

    Ok(SealedReplica {
        sector_access: path.as_ref().to_string_lossy().into_owned(),
        len,
        blake2b_checksum: checksum.as_bytes().to_vec(),
    })
}

pub fn get_sealed_sector_health(replica: &SealedReplica) -> Result<SealedSectorHealth> {
    let path = Path::new(&replica.sector_access);

    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(SealedSectorHealth::ErrorMissing)
        }
        Err(err) => return Err(err.into()),
    };

    if len != replica.len {
        return Ok(SealedSectorHealth::ErrorInvalidLength);
    }

    if calculate_checksum(path)?.as_bytes() != &replica.blake2b_checksum[..] {
        return Ok(SealedSectorHealth::ErrorInvalidChecksum);
    }

    Ok(SealedSectorHealth::Ok)
}

/// Pairs each proving sector with the health of its replica, hashing the
/// replicas in parallel. A sector without a recorded replica is reported
/// missing.
pub fn check_proving_sectors(
    proving: Vec<ProvingSectorMetadata>,
    check_health: bool,
) -> Result<Vec<GetProvingSectorResult>> {
    if !check_health {
        return Ok(proving
            .into_iter()
            .map(GetProvingSectorResult::WithoutHealth)
            .collect());
    }

    proving
        .into_par_iter()
        .map(|meta| -> Result<GetProvingSectorResult> {
            let health = match &meta.replica {
                Some(replica) => get_sealed_sector_health(replica)?,
                None => SealedSectorHealth::ErrorMissing,
            };
            Ok(GetProvingSectorResult::WithHealth(health, meta))
        })
        .collect()
}
