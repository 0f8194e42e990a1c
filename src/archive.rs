use crate::storage::{IntermediateFiles, StorageHandle};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;

const ZIP_MEDIA_TYPES: &[&str] = &["application/zip", "application/x-zip-compressed"];

/// The file the user picked. Only its location and metadata travel in
/// messages; the bytes are read from `path` when needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub path: PathBuf,
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl Archive {
    pub fn new(path: PathBuf, name: impl Into<String>, media_type: Option<String>) -> Self {
        Self {
            path,
            name: name.into(),
            media_type,
        }
    }

    /// Builds an archive reference from a local path, inferring the media type
    /// from the extension the way a browser file picker does.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let media_type = path
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.eq_ignore_ascii_case("zip"))
            .map(|_| "application/zip".to_string());
        Self::new(path.to_path_buf(), name, media_type)
    }

    pub fn open_zip(&self) -> Result<ZipArchive<BufReader<File>>> {
        let file = File::open(&self.path)?;
        Ok(ZipArchive::new(BufReader::new(file))?)
    }
}

/// Local check done before anything is sent to the worker.
pub fn is_zip_archive(archive: &Archive) -> bool {
    match archive.media_type.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => ZIP_MEDIA_TYPES
            .iter()
            .any(|zip_type| t.eq_ignore_ascii_case(zip_type)),
        _ => archive
            .name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("zip")),
    }
}

fn is_shp_name(name: &str) -> bool {
    name.len() > 4
        && name
            .get(name.len() - 4..)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(".shp"))
}

/// Relative names only; `..`, roots and drive prefixes are refused.
fn is_safe_entry_name(name: &str) -> bool {
    !name.contains('\\')
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn entry_names<R: Read + Seek>(zip: &mut ZipArchive<R>) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;
        if entry.is_dir() {
            continue;
        }
        names.push(entry.name().to_string());
    }
    Ok(names)
}

/// Paths of every `.shp` member, in the order the archive lists them.
/// An archive without any is not an error here.
pub fn list_shp_files(archive: &Archive) -> Result<Vec<String>> {
    let mut zip = archive.open_zip()?;
    let names = entry_names(&mut zip)?;
    Ok(names.into_iter().filter(|n| is_shp_name(n)).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbfEncoding {
    Utf8,
    ShiftJis,
}

/// One Shapefile dataset inside a ZIP archive, with its required `.dbf` and
/// `.shx` companions located.
pub struct ZippedShapefile {
    zip: ZipArchive<BufReader<File>>,
    shp_name: String,
    dbf_name: String,
    shx_name: String,
    prj_name: Option<String>,
    cpg_name: Option<String>,
}

impl ZippedShapefile {
    pub fn open(archive: &Archive, target: &str) -> Result<Self> {
        if !is_shp_name(target) {
            return Err(EngineError::NotAShapefile(target.to_string()));
        }
        if !is_safe_entry_name(target) {
            return Err(EngineError::UnsafeEntryName(target.to_string()));
        }
        let base = &target[..target.len() - 4];

        let mut zip = archive.open_zip()?;
        let names = entry_names(&mut zip)?;
        let find = |ext: &str| {
            let wanted = format!("{base}.{ext}");
            names
                .iter()
                .find(|n| n.eq_ignore_ascii_case(&wanted))
                .cloned()
        };

        let shp_name = names
            .iter()
            .find(|n| n.as_str() == target)
            .cloned()
            .ok_or_else(|| EngineError::MissingMember(target.to_string()))?;
        let dbf_name =
            find("dbf").ok_or_else(|| EngineError::MissingMember(format!("{base}.dbf")))?;
        let shx_name =
            find("shx").ok_or_else(|| EngineError::MissingMember(format!("{base}.shx")))?;
        // .prj and .cpg are optional.
        let prj_name = find("prj");
        let cpg_name = find("cpg");

        Ok(Self {
            zip,
            shp_name,
            dbf_name,
            shx_name,
            prj_name,
            cpg_name,
        })
    }

    pub fn target(&self) -> &str {
        &self.shp_name
    }

    /// Copies the three members into the intermediate files and rewinds them.
    pub fn stage(&mut self, files: &mut IntermediateFiles) -> Result<()> {
        let shp_name = self.shp_name.clone();
        let dbf_name = self.dbf_name.clone();
        let shx_name = self.shx_name.clone();
        self.copy_member(&shp_name, &mut files.geometry)?;
        self.copy_member(&dbf_name, &mut files.attributes)?;
        self.copy_member(&shx_name, &mut files.index)?;
        Ok(())
    }

    fn copy_member(&mut self, name: &str, dst: &mut StorageHandle) -> Result<()> {
        dst.truncate()?;
        let mut entry = self.zip.by_name(name)?;
        {
            let mut writer = BufWriter::new(&mut *dst);
            std::io::copy(&mut entry, &mut writer)?;
            writer.flush()?;
        }
        dst.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    pub fn read_prj(&mut self) -> Result<Option<String>> {
        let Some(name) = self.prj_name.clone() else {
            return Ok(None);
        };
        let mut wkt = String::new();
        self.zip.by_name(&name)?.read_to_string(&mut wkt)?;
        Ok(Some(wkt))
    }

    /// Encoding of the attribute table: the `.cpg` declaration when present,
    /// otherwise a guess from the file name.
    pub fn guess_encoding(&mut self) -> Result<DbfEncoding> {
        if let Some(name) = self.cpg_name.clone() {
            let mut cpg = String::new();
            match self.zip.by_name(&name) {
                Ok(mut reader) => {
                    reader.read_to_string(&mut cpg)?;
                }
                Err(ZipError::FileNotFound) => {
                    return Ok(guess_encoding_from_name(&self.shp_name));
                }
                Err(e) => return Err(e.into()),
            }
            return match cpg.trim().to_ascii_uppercase().as_str() {
                "UTF-8" | "UTF8" => Ok(DbfEncoding::Utf8),
                "CP932" | "SHIFT_JIS" | "SJIS" => Ok(DbfEncoding::ShiftJis),
                other => Err(EngineError::UnknownEncoding(other.to_string())),
            };
        }
        Ok(guess_encoding_from_name(&self.shp_name))
    }
}

fn guess_encoding_from_name(path: &str) -> DbfEncoding {
    let normalized = path.to_lowercase().replace('-', "").replace('_', "");
    if normalized.contains("utf8") {
        DbfEncoding::Utf8
    } else {
        DbfEncoding::ShiftJis
    }
}
