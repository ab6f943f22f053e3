//! Durable metadata catalog: configuration keys, the ordered volume table,
//! per-series rescue points and the mirror of registered series names.
//! Installed atomically (write temp, fsync, rename, fsync dir) with a CRC'd
//! payload, so a crashed sync never leaves a half-written catalog.

use crate::blockstore::VolumeDescriptor;
use crate::codec::crc32c;
use crate::error::DbError;
use crate::types::SeriesId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const CATALOG_MAGIC: &[u8; 8] = b"TSCMET01";
const CATALOG_VERSION: u32 = 1;

pub const CONFIG_DB_NAME: &str = "db_name";
pub const CONFIG_CREATION_DATETIME: &str = "creation_datetime";
pub const CONFIG_BLOCKSTORE_TYPE: &str = "blockstore_type";
pub const CONFIG_STORAGE_VERSION: &str = "storage_version";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CatalogData {
    config: BTreeMap<String, String>,
    volumes: Vec<VolumeDescriptor>,
    rescue_points: BTreeMap<SeriesId, Vec<u64>>,
    series: BTreeMap<SeriesId, String>,
}

/// File-backed key-value catalog. All reads come from the in-memory copy;
/// `sync` makes the current state durable.
#[derive(Debug)]
pub struct MetadataCatalog {
    path: PathBuf,
    state: RwLock<CatalogData>,
}

impl MetadataCatalog {
    /// Creates a new catalog file with the given config keys.
    pub fn create(path: &Path, config: &[(&str, &str)]) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut data = CatalogData::default();
        for (k, v) in config {
            data.config.insert(k.to_string(), v.to_string());
        }
        let catalog = MetadataCatalog {
            path: path.to_path_buf(),
            state: RwLock::new(data),
        };
        catalog.sync()?;
        Ok(catalog)
    }

    pub fn open(path: &Path) -> Result<Self, DbError> {
        let mut file = File::open(path).map_err(|_| {
            DbError::NotFound(format!("Metadata catalog {:?} does not exist", path))
        })?;
        let mut header = [0u8; 24];
        file.read_exact(&mut header)?;
        if &header[..8] != CATALOG_MAGIC {
            return Err(DbError::corruption(format!(
                "Bad catalog magic in {:?}",
                path
            )));
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != CATALOG_VERSION {
            return Err(DbError::corruption(format!(
                "Unsupported catalog version {} in {:?}",
                version, path
            )));
        }
        let payload_len = u64::from_le_bytes([
            header[12], header[13], header[14], header[15], header[16], header[17], header[18],
            header[19],
        ]) as usize;
        let expected_crc =
            u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        let mut payload = vec![0u8; payload_len];
        file.read_exact(&mut payload)?;
        if crc32c(&payload) != expected_crc {
            return Err(DbError::corruption(format!(
                "Catalog payload CRC mismatch in {:?}",
                path
            )));
        }
        let data: CatalogData = bincode::deserialize(&payload)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        Ok(MetadataCatalog {
            path: path.to_path_buf(),
            state: RwLock::new(data),
        })
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>, DbError> {
        Ok(self.state.read()?.config.get(key).cloned())
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.state
            .write()?
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn volumes(&self) -> Result<Vec<VolumeDescriptor>, DbError> {
        Ok(self.state.read()?.volumes.clone())
    }

    pub fn set_volumes(&self, volumes: Vec<VolumeDescriptor>) -> Result<(), DbError> {
        let mut state = self.state.write()?;
        state.volumes = volumes;
        state.volumes.sort_by_key(|v| v.id);
        Ok(())
    }

    pub fn update_rescue_points(&self, id: SeriesId, addrs: Vec<u64>) -> Result<(), DbError> {
        self.state.write()?.rescue_points.insert(id, addrs);
        Ok(())
    }

    pub fn rescue_points(&self) -> Result<HashMap<SeriesId, Vec<u64>>, DbError> {
        Ok(self
            .state
            .read()?
            .rescue_points
            .iter()
            .map(|(id, addrs)| (*id, addrs.clone()))
            .collect())
    }

    /// Mirrors newly registered series names; existing entries keep their id.
    pub fn register_series<'a, I>(&self, names: I) -> Result<(), DbError>
    where
        I: IntoIterator<Item = (SeriesId, &'a str)>,
    {
        let mut state = self.state.write()?;
        for (id, name) in names {
            state.series.insert(id, name.to_string());
        }
        Ok(())
    }

    pub fn series(&self) -> Result<Vec<(SeriesId, String)>, DbError> {
        Ok(self
            .state
            .read()?
            .series
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect())
    }

    /// Durably installs the current state.
    pub fn sync(&self) -> Result<(), DbError> {
        let payload = {
            let state = self.state.read()?;
            bincode::serialize(&*state).map_err(|e| DbError::Serialization(e.to_string()))?
        };
        let crc = crc32c(&payload);

        let tmp_path = self.path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(CATALOG_MAGIC)?;
        w.write_all(&CATALOG_VERSION.to_le_bytes())?;
        w.write_all(&(payload.len() as u64).to_le_bytes())?;
        w.write_all(&crc.to_le_bytes())?;
        w.write_all(&payload)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(d) = File::open(parent) {
                let _ = d.sync_data();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_sync_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.tsc");
        let catalog = MetadataCatalog::create(
            &path,
            &[
                (CONFIG_DB_NAME, "testdb"),
                (CONFIG_STORAGE_VERSION, "1"),
            ],
        )
        .unwrap();
        catalog.update_rescue_points(1024, vec![7, 9]).unwrap();
        catalog.register_series([(1024u64, "cpu host=a")]).unwrap();
        catalog.sync().unwrap();

        let reopened = MetadataCatalog::open(&path).unwrap();
        assert_eq!(
            reopened.get_config(CONFIG_DB_NAME).unwrap().as_deref(),
            Some("testdb")
        );
        assert_eq!(
            reopened.rescue_points().unwrap().get(&1024),
            Some(&vec![7, 9])
        );
        assert_eq!(
            reopened.series().unwrap(),
            vec![(1024, "cpu host=a".to_string())]
        );
    }

    #[test]
    fn unsynced_changes_are_not_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.tsc");
        let catalog = MetadataCatalog::create(&path, &[]).unwrap();
        catalog.set_config("k", "v").unwrap();
        // No sync; reopen sees the created state only.
        let reopened = MetadataCatalog::open(&path).unwrap();
        assert_eq!(reopened.get_config("k").unwrap(), None);
    }

    #[test]
    fn open_missing_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            MetadataCatalog::open(&dir.path().join("nope.tsc")),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.tsc");
        let catalog = MetadataCatalog::create(&path, &[(CONFIG_DB_NAME, "x")]).unwrap();
        drop(catalog);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            MetadataCatalog::open(&path),
            Err(DbError::Corruption { .. })
        ));
    }
}
