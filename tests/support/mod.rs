#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use shp2gp_engine::archive::{Archive, ZippedShapefile};
use shp2gp_engine::convert::{ConversionFault, ConvertJob, OutputFormat, ShapefileConverter};
use zip::write::FileOptions;

pub fn write_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> Archive {
    let path = dir.join(name);
    let file = File::create(&path).expect("create zip");
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (entry, contents) in entries {
        zip.start_file(*entry, options).expect("start file");
        zip.write_all(contents).expect("write entry");
    }
    zip.finish().expect("finish zip");
    Archive::from_path(&path)
}

/// A zipped dataset `<stem>.shp/.dbf/.shx` whose geometry member is
/// `geometry_len` bytes long.
pub fn dataset_zip(dir: &Path, name: &str, stems: &[&str], geometry_len: usize) -> Archive {
    let geometry = vec![b'g'; geometry_len];
    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    for stem in stems {
        entries.push((format!("{stem}.shp"), geometry.clone()));
        entries.push((format!("{stem}.dbf"), format!("attrs:{stem}").into_bytes()));
        entries.push((format!("{stem}.shx"), b"index".to_vec()));
    }
    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(n, b)| (n.as_str(), b.as_slice()))
        .collect();
    write_zip(dir, name, &borrowed)
}

/// Stages the dataset into the intermediate files and writes an output that
/// depends only on their contents and the format.
#[derive(Debug, Default)]
pub struct StagingConverter {
    pub calls: usize,
}

impl ShapefileConverter for StagingConverter {
    fn convert(&mut self, job: ConvertJob<'_>) -> Result<(), ConversionFault> {
        self.calls += 1;
        let mut shapefile = ZippedShapefile::open(job.archive, job.target)?;
        shapefile.stage(job.intermediates)?;

        let mut geometry = Vec::new();
        job.intermediates.geometry.read_to_end(&mut geometry)?;
        let mut attributes = String::new();
        job.intermediates.attributes.read_to_string(&mut attributes)?;
        job.intermediates.geometry.seek(SeekFrom::Start(0))?;

        let body = match job.format {
            OutputFormat::GeoJson => serde_json::json!({
                "type": "FeatureCollection",
                "features": [],
                "source": job.target,
                "geometry_bytes": geometry.len(),
                "attributes": attributes,
                "translate_colnames": job.options.translate_colnames,
            })
            .to_string()
            .into_bytes(),
            OutputFormat::GeoParquet => {
                let mut bytes = b"PAR1".to_vec();
                bytes.extend_from_slice(&geometry);
                bytes.extend_from_slice(attributes.as_bytes());
                bytes.extend_from_slice(b"PAR1");
                bytes
            }
        };
        job.output.write_all(&body)?;
        Ok(())
    }
}

/// Fails every conversion with the given fault.
pub struct FaultingConverter(pub ConversionFault);

impl ShapefileConverter for FaultingConverter {
    fn convert(&mut self, _job: ConvertJob<'_>) -> Result<(), ConversionFault> {
        Err(self.0.clone())
    }
}

/// Panics inside the converter with a payload that is not a string.
pub struct PanickingConverter;

impl ShapefileConverter for PanickingConverter {
    fn convert(&mut self, _job: ConvertJob<'_>) -> Result<(), ConversionFault> {
        std::panic::panic_any(0xdead_u32)
    }
}
