// Snapshot bridging
// Processors see a directory plus per-file metadata; the engine sees one byte archive

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::SnapshotMeta;

/// Manifest stored next to the snapshot files
pub const SNAPSHOT_MANIFEST: &str = "__raft_snapshot_meta.json";

const CURRENT_DIR: &str = "current";
const SAVE_STAGING_DIR: &str = "temp";
const INSTALL_STAGING_DIR: &str = "install";

/// Property bag attached to one snapshot file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileMeta {
    props: BTreeMap<String, String>,
}

impl LocalFileMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn props(&self) -> &BTreeMap<String, String> {
        &self.props
    }
}

/// Collects the files a save operation produces
#[derive(Debug)]
pub struct SnapshotWriter {
    path: PathBuf,
    files: BTreeMap<String, LocalFileMeta>,
}

impl SnapshotWriter {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            files: BTreeMap::new(),
        }
    }

    /// Directory save operations write into
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a file written under `path()`. Returns false for an invalid or
    /// already registered name.
    pub fn add_file(&mut self, name: impl Into<String>, meta: LocalFileMeta) -> bool {
        let name = name.into();
        if !valid_file_name(&name) || self.files.contains_key(&name) {
            return false;
        }
        self.files.insert(name, meta);
        true
    }

    pub fn remove_file(&mut self, name: &str) -> bool {
        self.files.remove(name).is_some()
    }

    pub fn list_files(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    pub(crate) fn into_files(self) -> BTreeMap<String, LocalFileMeta> {
        self.files
    }
}

/// Read side handed to load operations
#[derive(Debug)]
pub struct SnapshotReader {
    path: PathBuf,
    files: BTreeMap<String, LocalFileMeta>,
}

impl SnapshotReader {
    pub(crate) fn new(path: impl Into<PathBuf>, files: BTreeMap<String, LocalFileMeta>) -> Self {
        Self {
            path: path.into(),
            files,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list_files(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    pub fn file_meta(&self, name: &str) -> Option<&LocalFileMeta> {
        self.files.get(name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotManifest {
    pub meta: SnapshotMeta,
    pub files: BTreeMap<String, LocalFileMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchivedFile {
    name: String,
    meta: LocalFileMeta,
    content: String,
}

/// Engine-native snapshot payload
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotArchive {
    files: Vec<ArchivedFile>,
}

fn valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != SNAPSHOT_MANIFEST
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

/// The `snapshot/` directory of one group
#[derive(Clone, Debug)]
pub(crate) struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn current_dir(&self) -> PathBuf {
        self.root.join(CURRENT_DIR)
    }

    /// Fresh empty directory for a snapshot being saved
    pub fn save_staging(&self) -> io::Result<PathBuf> {
        self.fresh_dir(SAVE_STAGING_DIR)
    }

    /// Fresh empty directory for a snapshot received from the leader
    pub fn install_staging(&self) -> io::Result<PathBuf> {
        self.fresh_dir(INSTALL_STAGING_DIR)
    }

    fn fresh_dir(&self, name: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn read_manifest(&self) -> io::Result<Option<SnapshotManifest>> {
        let path = self.current_dir().join(SNAPSHOT_MANIFEST);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let manifest = serde_json::from_slice(&bytes).map_err(io::Error::other)?;
        Ok(Some(manifest))
    }

    /// Write the manifest into `staging` and swap it in as the current snapshot
    pub fn commit(&self, staging: &Path, manifest: &SnapshotManifest) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest).map_err(io::Error::other)?;
        fs::write(staging.join(SNAPSHOT_MANIFEST), bytes)?;

        let current = self.current_dir();
        if current.exists() {
            fs::remove_dir_all(&current)?;
        }
        fs::rename(staging, &current)?;
        debug!(
            path = %current.display(),
            snapshot_id = %manifest.meta.snapshot_id,
            "Snapshot committed"
        );
        Ok(())
    }

    /// Package the files of `dir` into the engine's snapshot payload
    pub fn pack(dir: &Path, files: &BTreeMap<String, LocalFileMeta>) -> io::Result<Vec<u8>> {
        let mut archive = SnapshotArchive::default();
        for (name, meta) in files {
            let content = fs::read(dir.join(name))?;
            archive.files.push(ArchivedFile {
                name: name.clone(),
                meta: meta.clone(),
                content: BASE64.encode(content),
            });
        }
        serde_json::to_vec(&archive).map_err(io::Error::other)
    }

    /// Inverse of `pack`: write every archived file into `dir`
    pub fn unpack(bytes: &[u8], dir: &Path) -> io::Result<BTreeMap<String, LocalFileMeta>> {
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        let archive: SnapshotArchive = serde_json::from_slice(bytes).map_err(io::Error::other)?;
        let mut files = BTreeMap::new();
        for file in archive.files {
            if !valid_file_name(&file.name) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid snapshot file name: {}", file.name),
                ));
            }
            let content = BASE64
                .decode(file.content.as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fs::write(dir.join(&file.name), content)?;
            files.insert(file.name, file.meta);
        }
        Ok(files)
    }
}
