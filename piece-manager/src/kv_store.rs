use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use blake2b_simd::Params;
use tempfile::NamedTempFile;

use crate::error::Result;

pub trait KeyValueStore: Sized + Send + Sync {
    fn initialize<P: AsRef<Path>>(root_dir: P) -> Result<Self>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Stores each value in its own file, named by the hash of its key. Writes go
/// to a temporary file which is then renamed over the destination, so a
/// reader never sees a partially written value.
#[derive(Debug)]
pub struct FileSystemKvs {
    root_dir: PathBuf,
}

impl FileSystemKvs {
    fn key_to_path(&self, key: &[u8]) -> PathBuf {
        let hash = Params::new().hash_length(32).hash(key);
        self.root_dir.join(hash.to_hex().as_str())
    }
}

impl KeyValueStore for FileSystemKvs {
    fn initialize<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        fs::create_dir_all(root_dir.as_ref())?;

        Ok(FileSystemKvs {
            root_dir: root_dir.as_ref().to_path_buf(),
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut file = NamedTempFile::new_in(&self.root_dir)?;
        file.write_all(value)?;
        file.as_file().sync_all()?;
        file.persist(self.key_to_path(key))
            .map_err(|err| err.error)?;

        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match File::open(self.key_to_path(key)) {
            Ok(mut file) => {
                let mut buf = vec![];
                file.read_to_end(&mut buf)?;
                Ok(Some(buf))
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpha() {
        let metadata_dir = tempfile::tempdir().unwrap();

        let db = FileSystemKvs::initialize(metadata_dir.path()).unwrap();

        let k_a = b"key-xx";
        let k_b = b"key-yy";
        let v_a = b"value-aa";
        let v_b = b"value-bb";

        db.put(k_a, v_a).unwrap();
        db.put(k_b, v_b).unwrap();

        let opt = db.get(k_a).unwrap();
        assert_eq!(format!("{:x?}", opt.unwrap()), format!("{:x?}", v_a));

        assert_eq!(None, db.get(b"missing").unwrap());
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let metadata_dir = tempfile::tempdir().unwrap();
        let db = FileSystemKvs::initialize(metadata_dir.path()).unwrap();

        db.put(b"k", b"first").unwrap();
        db.put(b"k", b"second").unwrap();

        assert_eq!(Some(b"second".to_vec()), db.get(b"k").unwrap());
        assert_eq!(1, fs::read_dir(metadata_dir.path()).unwrap().count());
    }
}
