//! On-disk capture store: a hierarchical container holding one group per
//! measurement point (`dac<level>`) and one dataset per event (`ev<index>`).
//! Groups are directories, datasets are gzip-compressed little-endian i16
//! arrays. Each dataset is flushed and closed as soon as it is written, so
//! everything already stored survives a later abort of the sweep.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::LinearityError;

const DATASET_EXT: &str = "gz";
const DATASET_MAGIC: [u8; 4] = *b"FEMB";
const META_FILE: &str = "meta.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    format_version: u32,
    created_unix_s: u64,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> LinearityError {
    LinearityError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Write handle to a capture store. Creating a writer truncates any store
/// previously rooted at the same path.
pub struct CaptureWriter {
    root: PathBuf,
}

impl CaptureWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LinearityError> {
        let root = path.as_ref().to_path_buf();
        if root.exists() {
            if root.join(META_FILE).is_file() {
                fs::remove_dir_all(&root)?;
            } else if root.read_dir()?.next().is_some() {
                return Err(corrupt(&root, "existing path is not a capture store"));
            }
        }
        fs::create_dir_all(&root)?;
        let meta = StoreMeta {
            format_version: FORMAT_VERSION,
            created_unix_s: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let file = File::create(root.join(META_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &meta)
            .map_err(|e| corrupt(&root, e.to_string()))?;
        Ok(Self { root })
    }

    pub fn create_group(&mut self, name: &str) -> Result<GroupWriter, LinearityError> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)?;
        Ok(GroupWriter { dir })
    }
}

/// Write handle to one measurement-point group.
pub struct GroupWriter {
    dir: PathBuf,
}

impl GroupWriter {
    /// Store one event array. The file is fully written, compressed and
    /// closed before this returns.
    pub fn write_dataset(&mut self, name: &str, data: &Array2<i16>) -> Result<(), LinearityError> {
        let path = self.dir.join(format!("{name}.{DATASET_EXT}"));
        let (rows, cols) = data.dim();
        let file = File::create(&path)?;
        let mut enc = GzEncoder::new(BufWriter::new(file), Compression::best());
        enc.write_all(&DATASET_MAGIC)?;
        enc.write_all(&(rows as u32).to_le_bytes())?;
        enc.write_all(&(cols as u32).to_le_bytes())?;
        for &sample in data.iter() {
            enc.write_all(&sample.to_le_bytes())?;
        }
        enc.finish()?.into_inner().map_err(|e| e.into_error())?;
        Ok(())
    }
}

/// Read-only handle to a capture store.
pub struct CaptureReader {
    root: PathBuf,
}

impl CaptureReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinearityError> {
        let root = path.as_ref().to_path_buf();
        let meta_path = root.join(META_FILE);
        let file = File::open(&meta_path)?;
        let meta: StoreMeta = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| corrupt(&root, e.to_string()))?;
        if meta.format_version != FORMAT_VERSION {
            return Err(corrupt(
                &root,
                format!("unsupported format version {}", meta.format_version),
            ));
        }
        Ok(Self { root })
    }

    pub fn group_names(&self) -> Result<Vec<String>, LinearityError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    pub fn group(&self, name: &str) -> GroupReader {
        GroupReader {
            dir: self.root.join(name),
        }
    }
}

/// Read-only handle to one measurement-point group.
pub struct GroupReader {
    dir: PathBuf,
}

impl GroupReader {
    pub fn dataset_names(&self) -> Result<Vec<String>, LinearityError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(&format!(".{DATASET_EXT}")) {
                names.push(stem.to_owned());
            }
        }
        Ok(names)
    }

    pub fn read_dataset(&self, name: &str) -> Result<Array2<i16>, LinearityError> {
        let path = self.dir.join(format!("{name}.{DATASET_EXT}"));
        let file = File::open(&path)?;
        let mut dec = GzDecoder::new(BufReader::new(file));
        let mut header = [0u8; 12];
        dec.read_exact(&mut header)
            .map_err(|_| corrupt(&path, "truncated dataset header"))?;
        if header[..4] != DATASET_MAGIC {
            return Err(corrupt(&path, "bad dataset magic"));
        }
        let rows = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let cols = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let mut raw = Vec::with_capacity(rows * cols * 2);
        dec.read_to_end(&mut raw)?;
        if raw.len() != rows * cols * 2 {
            return Err(corrupt(
                &path,
                format!("expected {} sample bytes, got {}", rows * cols * 2, raw.len()),
            ));
        }
        let samples: Vec<i16> = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Array2::from_shape_vec((rows, cols), samples)
            .map_err(|e| corrupt(&path, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn dataset_round_trip_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("femb0");
        let data = array![[1i16, -2, 300, -400], [i16::MIN, i16::MAX, 0, 7]];

        let mut writer = CaptureWriter::create(&root).unwrap();
        let mut group = writer.create_group("dac5").unwrap();
        group.write_dataset("ev0", &data).unwrap();

        let reader = CaptureReader::open(&root).unwrap();
        let back = reader.group("dac5").read_dataset("ev0").unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn enumeration_reports_groups_and_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("femb0");
        let data = Array2::<i16>::zeros((2, 8));

        let mut writer = CaptureWriter::create(&root).unwrap();
        for dac in [0u32, 5, 10] {
            let mut group = writer.create_group(&format!("dac{dac}")).unwrap();
            group.write_dataset("ev0", &data).unwrap();
            group.write_dataset("ev1", &data).unwrap();
        }

        let reader = CaptureReader::open(&root).unwrap();
        let mut groups = reader.group_names().unwrap();
        groups.sort();
        assert_eq!(groups, vec!["dac0", "dac10", "dac5"]);
        let mut events = reader.group("dac5").dataset_names().unwrap();
        events.sort();
        assert_eq!(events, vec!["ev0", "ev1"]);
    }

    #[test]
    fn create_truncates_an_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("femb0");
        let data = Array2::<i16>::zeros((1, 4));

        let mut writer = CaptureWriter::create(&root).unwrap();
        writer
            .create_group("dac7")
            .unwrap()
            .write_dataset("ev0", &data)
            .unwrap();
        drop(writer);

        let _writer = CaptureWriter::create(&root).unwrap();
        let reader = CaptureReader::open(&root).unwrap();
        assert!(reader.group_names().unwrap().is_empty());
    }

    #[test]
    fn create_refuses_a_foreign_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not_a_store");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("something.txt"), b"hello").unwrap();
        assert!(matches!(
            CaptureWriter::create(&root),
            Err(LinearityError::Corrupt { .. })
        ));
    }

    #[test]
    fn truncated_dataset_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("femb0");
        let mut writer = CaptureWriter::create(&root).unwrap();
        writer.create_group("dac1").unwrap();
        fs::write(root.join("dac1").join("ev0.gz"), b"not gzip at all").unwrap();

        let reader = CaptureReader::open(&root).unwrap();
        assert!(reader.group("dac1").read_dataset("ev0").is_err());
    }
}
