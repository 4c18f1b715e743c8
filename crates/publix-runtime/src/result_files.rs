//! Storage of result files uploaded by components.
//!
//! Files are keyed by (run, component-run, filename). A download by
//! (run, filename) returns the upload with the highest component-run id, so
//! the newest file under a name wins whichever component wrote it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use publix_kernel::{ComponentRunId, RunId};

const MAX_FILENAME_LEN: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("bad filename '{0}'")]
    BadFilename(String),
    #[error("{0}")]
    NotFound(String),
    #[error("result file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("result file store: {0}")]
    Backend(String),
}

/// Rejects empty names, names over 100 bytes, `.`-prefixed names and any
/// character outside `[A-Za-z0-9._-]`; path separators never pass.
pub fn check_filename(filename: &str) -> Result<(), FileStoreError> {
    let valid = !filename.is_empty()
        && filename.len() <= MAX_FILENAME_LEN
        && !filename.starts_with('.')
        && !filename.contains("..")
        && filename
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(FileStoreError::BadFilename(filename.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub run_id: RunId,
    pub component_run_id: ComponentRunId,
    pub filename: String,
    pub size: u64,
}

pub trait ResultFileStore: Send + Sync {
    /// Stores (or replaces) a file.
    fn put(
        &self,
        run_id: RunId,
        component_run_id: ComponentRunId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, FileStoreError>;

    /// Newest upload of `filename` in the run, optionally restricted to one
    /// component-run.
    fn latest(
        &self,
        run_id: RunId,
        filename: &str,
        component_run_id: Option<ComponentRunId>,
    ) -> Result<Option<Vec<u8>>, FileStoreError>;

    /// Total bytes stored for the run.
    fn run_usage(&self, run_id: RunId) -> Result<u64, FileStoreError>;

    /// Size of the file a `put` with the same key would replace.
    fn file_size(
        &self,
        run_id: RunId,
        component_run_id: ComponentRunId,
        filename: &str,
    ) -> Result<Option<u64>, FileStoreError>;
}

type FileKey = (RunId, ComponentRunId, String);

#[derive(Debug, Default)]
pub struct InMemoryResultFileStore {
    files: RwLock<BTreeMap<FileKey, Vec<u8>>>,
}

impl InMemoryResultFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultFileStore for InMemoryResultFileStore {
    fn put(
        &self,
        run_id: RunId,
        component_run_id: ComponentRunId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, FileStoreError> {
        check_filename(filename)?;
        let mut files = self
            .files
            .write()
            .map_err(|e| FileStoreError::Backend(e.to_string()))?;
        files.insert(
            (run_id, component_run_id, filename.to_string()),
            bytes.to_vec(),
        );
        Ok(StoredFile {
            run_id,
            component_run_id,
            filename: filename.to_string(),
            size: bytes.len() as u64,
        })
    }

    fn latest(
        &self,
        run_id: RunId,
        filename: &str,
        component_run_id: Option<ComponentRunId>,
    ) -> Result<Option<Vec<u8>>, FileStoreError> {
        let files = self
            .files
            .read()
            .map_err(|e| FileStoreError::Backend(e.to_string()))?;
        // BTreeMap order puts the highest component-run id last.
        Ok(files
            .iter()
            .filter(|((run, comp, name), _)| {
                *run == run_id
                    && name == filename
                    && component_run_id.map_or(true, |wanted| wanted == *comp)
            })
            .last()
            .map(|(_, bytes)| bytes.clone()))
    }

    fn run_usage(&self, run_id: RunId) -> Result<u64, FileStoreError> {
        let files = self
            .files
            .read()
            .map_err(|e| FileStoreError::Backend(e.to_string()))?;
        Ok(files
            .iter()
            .filter(|((run, _, _), _)| *run == run_id)
            .map(|(_, bytes)| bytes.len() as u64)
            .sum())
    }

    fn file_size(
        &self,
        run_id: RunId,
        component_run_id: ComponentRunId,
        filename: &str,
    ) -> Result<Option<u64>, FileStoreError> {
        let files = self
            .files
            .read()
            .map_err(|e| FileStoreError::Backend(e.to_string()))?;
        Ok(files
            .get(&(run_id, component_run_id, filename.to_string()))
            .map(|bytes| bytes.len() as u64))
    }
}

/// Filesystem store: `<root>/run_<id>/comp_<id>/<filename>`.
#[derive(Clone, Debug)]
pub struct FsResultFileStore {
    root: PathBuf,
}

impl FsResultFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(format!("run_{}", run_id))
    }

    fn component_dirs(&self, run_id: RunId) -> Result<Vec<(ComponentRunId, PathBuf)>, FileStoreError> {
        let run_dir = self.run_dir(run_id);
        if !run_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&run_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_prefix("comp_"))
                .and_then(|n| n.parse::<ComponentRunId>().ok());
            if let Some(id) = id {
                dirs.push((id, entry.path()));
            }
        }
        dirs.sort_by_key(|(id, _)| *id);
        Ok(dirs)
    }

    fn dir_size(path: &Path) -> Result<u64, FileStoreError> {
        let mut total = 0;
        for entry in fs::read_dir(path)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

impl ResultFileStore for FsResultFileStore {
    fn put(
        &self,
        run_id: RunId,
        component_run_id: ComponentRunId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, FileStoreError> {
        check_filename(filename)?;
        let dir = self
            .run_dir(run_id)
            .join(format!("comp_{}", component_run_id));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(filename), bytes)?;
        Ok(StoredFile {
            run_id,
            component_run_id,
            filename: filename.to_string(),
            size: bytes.len() as u64,
        })
    }

    fn latest(
        &self,
        run_id: RunId,
        filename: &str,
        component_run_id: Option<ComponentRunId>,
    ) -> Result<Option<Vec<u8>>, FileStoreError> {
        check_filename(filename)?;
        for (id, dir) in self.component_dirs(run_id)?.into_iter().rev() {
            if component_run_id.is_some_and(|wanted| wanted != id) {
                continue;
            }
            let path = dir.join(filename);
            if path.is_file() {
                return Ok(Some(fs::read(path)?));
            }
        }
        Ok(None)
    }

    fn run_usage(&self, run_id: RunId) -> Result<u64, FileStoreError> {
        let mut total = 0;
        for (_, dir) in self.component_dirs(run_id)? {
            total += Self::dir_size(&dir)?;
        }
        Ok(total)
    }

    fn file_size(
        &self,
        run_id: RunId,
        component_run_id: ComponentRunId,
        filename: &str,
    ) -> Result<Option<u64>, FileStoreError> {
        check_filename(filename)?;
        let path = self
            .run_dir(run_id)
            .join(format!("comp_{}", component_run_id))
            .join(filename);
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
