use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

pub const GEOMETRY_NAME: &str = "tmp.shp";
pub const ATTRIBUTES_NAME: &str = "tmp.dbf";
pub const INDEX_NAME: &str = "tmp.shx";
// No extension needed; the caller gets the real filename separately.
pub const OUTPUT_NAME: &str = "tmp_output";

#[derive(Debug, Default)]
struct Registry {
    open: BTreeSet<String>,
    acquired: BTreeMap<String, u64>,
    released: BTreeMap<String, u64>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

static REGISTRIES: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<Registry>>>>> = OnceLock::new();

/// One registry per directory for the whole process, so every area opened on
/// the same root sees the same open names.
fn shared_registry(root: &Path) -> Result<Arc<Mutex<Registry>>> {
    let key = std::fs::canonicalize(root)?;
    let mut registries = REGISTRIES
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Ok(registries.entry(key).or_default().clone())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub open: Vec<String>,
    pub acquired: BTreeMap<String, u64>,
    pub released: BTreeMap<String, u64>,
}

impl StorageStats {
    /// True when nothing is open and every acquisition has a matching release.
    pub fn is_balanced(&self) -> bool {
        self.open.is_empty() && self.acquired == self.released
    }
}

/// The private area that holds temporary conversion files. Each name can be
/// held by one [`StorageHandle`] at a time.
#[derive(Debug, Clone)]
pub struct StorageArea {
    root: PathBuf,
    registry: Arc<Mutex<Registry>>,
}

impl StorageArea {
    pub fn open(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let registry = shared_registry(&root)?;
        Ok(Self { root, registry })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates or opens `name`, truncates it, and hands back an exclusive
    /// read/write handle. Fails immediately if the name is already held.
    pub fn acquire(&self, name: &str) -> Result<StorageHandle> {
        let path = self.object_path(name)?;

        {
            let mut registry = lock(&self.registry);
            if !registry.open.insert(name.to_string()) {
                return Err(EngineError::ResourceBusy {
                    name: name.to_string(),
                });
            }
        }

        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path);

        let mut registry = lock(&self.registry);
        match opened {
            Ok(file) => {
                *registry.acquired.entry(name.to_string()).or_default() += 1;
                Ok(StorageHandle {
                    name: name.to_string(),
                    file: Some(file),
                    registry: self.registry.clone(),
                })
            }
            Err(e) => {
                registry.open.remove(name);
                Err(e.into())
            }
        }
    }

    pub fn file(&self, name: &str) -> StoredFile {
        StoredFile::new(name)
    }

    pub fn is_open(&self, name: &str) -> bool {
        lock(&self.registry).open.contains(name)
    }

    pub fn read_bytes(&self, file: &StoredFile) -> Result<Vec<u8>> {
        let path = self.closed_object_path(file.name())?;
        Ok(std::fs::read(path)?)
    }

    pub fn sha256_hex(&self, file: &StoredFile) -> Result<String> {
        let path = self.closed_object_path(file.name())?;
        let mut reader = std::io::BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Removes a storage object the caller has finished reading.
    pub fn discard(&self, file: &StoredFile) -> Result<()> {
        let path = self.closed_object_path(file.name())?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self) -> StorageStats {
        let registry = lock(&self.registry);
        StorageStats {
            open: registry.open.iter().cloned().collect(),
            acquired: registry.acquired.clone(),
            released: registry.released.clone(),
        }
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(|c: char| c == '/' || c == '\\');
        if !valid {
            return Err(EngineError::InvalidStorageName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    fn closed_object_path(&self, name: &str) -> Result<PathBuf> {
        let path = self.object_path(name)?;
        if self.is_open(name) {
            return Err(EngineError::ResourceBusy {
                name: name.to_string(),
            });
        }
        Ok(path)
    }
}

/// Exclusive synchronous access to one storage object.
///
/// Released exactly once: either explicitly through [`StorageHandle::release`]
/// or, if that never happens, when the handle is dropped.
#[derive(Debug)]
pub struct StorageHandle {
    name: String,
    file: Option<File>,
    registry: Arc<Mutex<Registry>>,
}

impl StorageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or_else(released_error)?;
        Ok(file.metadata()?.len())
    }

    /// Drops everything written so far and moves back to the start.
    pub fn truncate(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(released_error)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Flushes and closes the handle.
    pub fn release(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let flushed = file.flush().and_then(|_| file.sync_all());
        drop(file);

        let mut registry = lock(&self.registry);
        registry.open.remove(&self.name);
        *registry.released.entry(self.name.clone()).or_default() += 1;
        drop(registry);

        flushed.map_err(EngineError::from)
    }

    fn file_mut(&mut self) -> std::io::Result<&mut File> {
        self.file.as_mut().ok_or_else(released_error)
    }
}

fn released_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Other,
        "storage handle was already released",
    )
}

impl Read for StorageHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file_mut()?.read(buf)
    }
}

impl Write for StorageHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl Seek for StorageHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A name-level reference to a storage object, detached from any open handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredFile {
    name: String,
}

impl StoredFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Scratch copies of the three members of one Shapefile dataset. Converters
/// need them because ZIP members can be read but not seeked.
#[derive(Debug)]
pub struct IntermediateFiles {
    pub geometry: StorageHandle,
    pub attributes: StorageHandle,
    pub index: StorageHandle,
}

impl IntermediateFiles {
    /// Acquires the fixed-name triple. If one acquisition fails, the handles
    /// already taken are released on the way out.
    pub fn acquire(area: &StorageArea) -> Result<Self> {
        let geometry = area.acquire(GEOMETRY_NAME)?;
        let attributes = area.acquire(ATTRIBUTES_NAME)?;
        let index = area.acquire(INDEX_NAME)?;
        Ok(Self {
            geometry,
            attributes,
            index,
        })
    }

    /// Releases all three handles, reporting the first error after every
    /// handle has been closed.
    pub fn release(self) -> Result<()> {
        let Self {
            geometry,
            attributes,
            index,
        } = self;
        let geometry = geometry.release();
        let attributes = attributes.release();
        let index = index.release();
        geometry.and(attributes).and(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> (tempfile::TempDir, StorageArea) {
        let dir = tempfile::tempdir().expect("tempdir");
        let area = StorageArea::open(dir.path().join("storage")).expect("open area");
        (dir, area)
    }

    #[test]
    fn acquire_of_open_name_fails_fast() {
        let (_dir, area) = area();
        let first = area.acquire(OUTPUT_NAME).expect("first acquire");

        let err = area.acquire(OUTPUT_NAME).expect_err("second acquire must fail");
        assert!(matches!(err, EngineError::ResourceBusy { ref name } if name == OUTPUT_NAME));

        first.release().expect("release");
        area.acquire(OUTPUT_NAME).expect("acquire after release");
    }

    #[test]
    fn areas_on_the_same_root_share_exclusivity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = StorageArea::open(dir.path().join("storage")).expect("first area");
        let second =
            StorageArea::open(dir.path().join("storage").join(".")).expect("second area");

        let held = first.acquire(OUTPUT_NAME).expect("acquire in first area");
        let err = second
            .acquire(OUTPUT_NAME)
            .expect_err("held through the other area");
        assert!(matches!(err, EngineError::ResourceBusy { ref name } if name == OUTPUT_NAME));
        assert!(matches!(
            second.read_bytes(&second.file(OUTPUT_NAME)),
            Err(EngineError::ResourceBusy { .. })
        ));

        held.release().expect("release");
        second
            .acquire(OUTPUT_NAME)
            .expect("free after release")
            .release()
            .expect("release");
        assert!(first.stats().is_balanced());
        assert_eq!(second.stats(), first.stats());
    }

    #[test]
    fn acquire_truncates_previous_contents() {
        let (_dir, area) = area();
        let mut handle = area.acquire(OUTPUT_NAME).expect("acquire");
        handle.write_all(b"first conversion output").expect("write");
        handle.release().expect("release");

        let mut handle = area.acquire(OUTPUT_NAME).expect("reacquire");
        assert_eq!(handle.size().expect("size"), 0);
        handle.write_all(b"second").expect("write");
        handle.release().expect("release");

        let bytes = area.read_bytes(&StoredFile::new(OUTPUT_NAME)).expect("read");
        assert_eq!(bytes, b"second");
    }

    #[test]
    fn drop_releases_exactly_once() {
        let (_dir, area) = area();
        {
            let _handle = area.acquire(GEOMETRY_NAME).expect("acquire");
            assert!(area.is_open(GEOMETRY_NAME));
        }
        let handle = area.acquire(GEOMETRY_NAME).expect("acquire again");
        handle.release().expect("release");

        let stats = area.stats();
        assert!(stats.is_balanced(), "stats: {stats:?}");
        assert_eq!(stats.acquired.get(GEOMETRY_NAME), Some(&2));
        assert_eq!(stats.released.get(GEOMETRY_NAME), Some(&2));
    }

    #[test]
    fn partial_triple_acquisition_releases_what_it_took() {
        let (_dir, area) = area();
        let blocker = area.acquire(INDEX_NAME).expect("block index");

        let err = IntermediateFiles::acquire(&area).expect_err("index is held");
        assert!(matches!(err, EngineError::ResourceBusy { .. }));
        assert!(!area.is_open(GEOMETRY_NAME));
        assert!(!area.is_open(ATTRIBUTES_NAME));

        blocker.release().expect("release blocker");
        let files = IntermediateFiles::acquire(&area).expect("acquire triple");
        files.release().expect("release triple");
        assert!(area.stats().is_balanced());
    }

    #[test]
    fn open_objects_cannot_be_read_or_discarded() {
        let (_dir, area) = area();
        let handle = area.acquire(OUTPUT_NAME).expect("acquire");
        let file = area.file(OUTPUT_NAME);

        assert!(matches!(
            area.read_bytes(&file),
            Err(EngineError::ResourceBusy { .. })
        ));
        assert!(matches!(
            area.discard(&file),
            Err(EngineError::ResourceBusy { .. })
        ));

        handle.release().expect("release");
        area.discard(&file).expect("discard");
        area.discard(&file).expect("discard twice is fine");
    }

    #[test]
    fn rejects_names_that_escape_the_area() {
        let (_dir, area) = area();
        for name in ["", ".", "..", "../escape", "a/b", "a\\b"] {
            assert!(
                matches!(area.acquire(name), Err(EngineError::InvalidStorageName(_))),
                "{name:?} should be rejected"
            );
        }
        assert!(area.stats().open.is_empty());
    }

    #[test]
    fn handle_reads_back_what_was_written() {
        let (_dir, area) = area();
        let mut handle = area.acquire(ATTRIBUTES_NAME).expect("acquire");
        handle.write_all(b"dbase rows").expect("write");
        handle.seek(SeekFrom::Start(0)).expect("rewind");
        let mut text = String::new();
        handle.read_to_string(&mut text).expect("read");
        assert_eq!(text, "dbase rows");

        handle.truncate().expect("truncate");
        assert_eq!(handle.size().expect("size"), 0);
        handle.release().expect("release");
    }

    #[test]
    fn sha256_of_stored_file() {
        let (_dir, area) = area();
        let mut handle = area.acquire(OUTPUT_NAME).expect("acquire");
        handle.write_all(b"abc").expect("write");
        handle.release().expect("release");

        let digest = area.sha256_hex(&area.file(OUTPUT_NAME)).expect("digest");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
