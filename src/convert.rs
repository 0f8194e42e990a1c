use crate::archive::{self, Archive};
use crate::storage::{IntermediateFiles, StorageHandle};
use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Message used when a converter fails without any usable text.
pub const UNKNOWN_ERROR_MESSAGE: &str = "unknown error";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    GeoParquet,
    GeoJson,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::GeoParquet => "GeoParquet",
            OutputFormat::GeoJson => "GeoJson",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "GeoParquet" => Some(OutputFormat::GeoParquet),
            "GeoJson" => Some(OutputFormat::GeoJson),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::GeoParquet => "parquet",
            OutputFormat::GeoJson => "geojson",
        }
    }
}

/// Toggles forwarded untouched to the converter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversionOptions {
    pub translate_colnames: bool,
    pub translate_contents: bool,
    pub ignore_translation_errors: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            translate_colnames: true,
            translate_contents: true,
            ignore_translation_errors: false,
        }
    }
}

/// Whatever a converter raised. `message` is `None` when the failure carried no
/// text (an opaque error value or a non-string panic payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionFault {
    message: Option<String>,
}

impl ConversionFault {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    pub fn opaque() -> Self {
        Self { message: None }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            return Self::message(*s);
        }
        match payload.downcast::<String>() {
            Ok(s) => Self::message(*s),
            Err(_) => Self::opaque(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The message shown to the user: the raised text verbatim, or the generic
    /// fallback when there is nothing readable.
    pub fn user_message(&self) -> String {
        match self.message.as_deref() {
            Some(m) if !m.trim().is_empty() => m.to_string(),
            _ => UNKNOWN_ERROR_MESSAGE.to_string(),
        }
    }
}

impl std::fmt::Display for ConversionFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for ConversionFault {}

impl From<EngineError> for ConversionFault {
    fn from(value: EngineError) -> Self {
        Self::message(value.to_string())
    }
}

impl From<std::io::Error> for ConversionFault {
    fn from(value: std::io::Error) -> Self {
        Self::message(format!("IO error: {value}"))
    }
}

/// Everything one conversion needs. The handles stay owned by the caller; the
/// converter only borrows them.
pub struct ConvertJob<'a> {
    pub archive: &'a Archive,
    pub target: &'a str,
    pub intermediates: &'a mut IntermediateFiles,
    pub output: &'a mut StorageHandle,
    pub format: OutputFormat,
    pub options: &'a ConversionOptions,
}

/// The external Shapefile conversion library.
///
/// `list_shp_files` must be free of side effects and return the same list in
/// the same order for the same archive. `convert` reads the dataset at
/// `job.target`, may use the intermediate files as seekable scratch space, and
/// writes the encoded result to `job.output`.
pub trait ShapefileConverter {
    fn list_shp_files(&self, archive: &Archive) -> crate::Result<Vec<String>> {
        archive::list_shp_files(archive)
    }

    fn convert(&mut self, job: ConvertJob<'_>) -> Result<(), ConversionFault>;
}

impl<C: ShapefileConverter + ?Sized> ShapefileConverter for Box<C> {
    fn list_shp_files(&self, archive: &Archive) -> crate::Result<Vec<String>> {
        (**self).list_shp_files(archive)
    }

    fn convert(&mut self, job: ConvertJob<'_>) -> Result<(), ConversionFault> {
        (**self).convert(job)
    }
}

/// `data/region.shp` + GeoJson -> `region.geojson`.
pub fn output_filename(target: &str, format: OutputFormat) -> String {
    let base = target
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(target);
    let stem = match base.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => base,
    };
    let stem = if stem.is_empty() { "output" } else { stem };
    format!("{stem}.{}", format.extension())
}

pub fn resolve_candidates<C: ShapefileConverter + ?Sized>(
    converter: &C,
    archive: &Archive,
) -> Result<Vec<String>, ConversionFault> {
    match catch_unwind(AssertUnwindSafe(|| converter.list_shp_files(archive))) {
        Ok(Ok(candidates)) => Ok(candidates),
        Ok(Err(e)) => Err(e.into()),
        Err(payload) => Err(ConversionFault::from_panic(payload)),
    }
}

/// Runs the converter and returns the name the output should be saved under.
/// A fault is passed back as raised; nothing is retried.
pub fn invoke<C: ShapefileConverter + ?Sized>(
    converter: &mut C,
    job: ConvertJob<'_>,
) -> Result<String, ConversionFault> {
    let filename = output_filename(job.target, job.format);
    match catch_unwind(AssertUnwindSafe(|| converter.convert(job))) {
        Ok(Ok(())) => Ok(filename),
        Ok(Err(fault)) => Err(fault),
        Err(payload) => Err(ConversionFault::from_panic(payload)),
    }
}
