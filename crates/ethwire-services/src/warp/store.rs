//! Snapshot storage.
//!
//! Layout under the snapshot directory:
//!   MANIFEST            manifest RLP
//!   <hex chunk hash>    one file per verified chunk

use std::io;
use std::path::{Path, PathBuf};

use ethereum_types::H256;

use ethwire_core::message::Manifest;

pub const MANIFEST_FILE: &str = "MANIFEST";

pub trait SnapshotStorage: Send + Sync {
    /// Raw manifest RLP, if a snapshot is present.
    fn read_manifest(&self) -> Option<Vec<u8>>;

    fn read_chunk(&self, hash: &H256) -> Option<Vec<u8>>;

    fn has_chunk(&self, hash: &H256) -> bool;

    fn write_manifest(&self, manifest: &[u8]) -> io::Result<()>;

    fn write_chunk(&self, hash: &H256, data: &[u8]) -> io::Result<()>;

    /// Block hash and number of the stored snapshot, for WarpStatus.
    fn snapshot_info(&self) -> Option<(H256, u64)> {
        let raw = self.read_manifest()?;
        let manifest: Manifest = rlp::decode(&raw).ok()?;
        Some((manifest.block_hash, manifest.block_number))
    }
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chunk_path(&self, hash: &H256) -> PathBuf {
        self.dir.join(hex::encode(hash))
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(path, data)
    }
}

impl SnapshotStorage for FileSnapshotStore {
    fn read_manifest(&self) -> Option<Vec<u8>> {
        std::fs::read(self.dir.join(MANIFEST_FILE)).ok()
    }

    fn read_chunk(&self, hash: &H256) -> Option<Vec<u8>> {
        std::fs::read(self.chunk_path(hash)).ok()
    }

    fn has_chunk(&self, hash: &H256) -> bool {
        self.chunk_path(hash).is_file()
    }

    fn write_manifest(&self, manifest: &[u8]) -> io::Result<()> {
        self.write(&self.dir.join(MANIFEST_FILE), manifest)
    }

    fn write_chunk(&self, hash: &H256, data: &[u8]) -> io::Result<()> {
        self.write(&self.chunk_path(hash), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethwire_core::crypto::keccak256;

    fn temp_store(name: &str) -> FileSnapshotStore {
        let dir = std::env::temp_dir().join(format!("ethwire-store-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        FileSnapshotStore::new(dir)
    }

    #[test]
    fn chunks_are_named_by_hex_hash() {
        let store = temp_store("chunks");
        let data = b"chunk bytes".to_vec();
        let hash = keccak256(&data);
        assert!(!store.has_chunk(&hash));

        store.write_chunk(&hash, &data).unwrap();
        assert!(store.has_chunk(&hash));
        assert_eq!(store.read_chunk(&hash), Some(data));
        assert!(store.dir().join(format!("{:x}", hash)).is_file());

        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[test]
    fn manifest_roundtrip_and_info() {
        let store = temp_store("manifest");
        assert!(store.read_manifest().is_none());
        assert!(store.snapshot_info().is_none());

        let manifest = Manifest {
            version: 2,
            state_hashes: vec![H256::repeat_byte(1)],
            block_hashes: vec![],
            state_root: H256::repeat_byte(2),
            block_number: 4_000_000,
            block_hash: H256::repeat_byte(3),
        };
        store.write_manifest(&rlp::encode(&manifest)).unwrap();
        assert_eq!(store.snapshot_info(), Some((H256::repeat_byte(3), 4_000_000)));

        let _ = std::fs::remove_dir_all(store.dir());
    }
}
