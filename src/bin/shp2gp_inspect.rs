use std::path::{Path, PathBuf};

use shp2gp_engine::archive::{is_zip_archive, list_shp_files, Archive, ZippedShapefile};
use shp2gp_engine::config::load_settings;
use shp2gp_engine::logs::{log_retention_policy, prune_logs};
use shp2gp_engine::paths::AppPaths;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut archives: Vec<PathBuf> = Vec::new();
    let mut show_settings = false;
    let mut prune = false;
    let mut download_dir: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--archive" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--archive requires a value".to_string())?;
                archives.push(PathBuf::from(v));
            }
            "--download-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--download-dir requires a value".to_string())?;
                download_dir = Some(v.to_string());
            }
            "--settings" => show_settings = true,
            "--prune-logs" => prune = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    if archives.is_empty() && !show_settings && !prune && download_dir.is_none() {
        return Err("nothing to do (pass --archive, --settings or --prune-logs)".to_string());
    }

    for path in &archives {
        inspect_archive(path)?;
    }

    if !show_settings && !prune && download_dir.is_none() {
        return Ok(());
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;

    if let Some(dir) = download_dir {
        // An empty value goes back to the default directory.
        if dir.trim().is_empty() {
            paths
                .clear_download_dir_override()
                .map_err(|e| e.to_string())?;
        } else {
            paths
                .set_download_dir_override(&PathBuf::from(dir.trim()))
                .map_err(|e| e.to_string())?;
        }
    }

    if show_settings {
        let settings = load_settings(&paths).map_err(|e| e.to_string())?;
        let json = serde_json::to_string_pretty(&settings).map_err(|e| e.to_string())?;
        println!("Base dir: {}", paths.base_dir.to_string_lossy());
        println!(
            "Download dir: {}",
            paths
                .effective_download_dir()
                .map_err(|e| e.to_string())?
                .to_string_lossy()
        );
        println!("Settings:\n{json}");
        let retention =
            serde_json::to_string_pretty(&log_retention_policy()).map_err(|e| e.to_string())?;
        println!("Log retention:\n{retention}");
    }

    if prune {
        let removed = prune_logs(&paths).map_err(|e| e.to_string())?;
        println!(
            "Logs pruned: {removed} removed from {}",
            paths.logs_dir().to_string_lossy()
        );
    }

    Ok(())
}

fn inspect_archive(path: &Path) -> Result<(), String> {
    let archive = Archive::from_path(path);
    if !is_zip_archive(&archive) {
        return Err(format!("{}: not a ZIP file", path.to_string_lossy()));
    }

    let candidates = list_shp_files(&archive).map_err(|e| e.to_string())?;
    println!("{} ({} datasets)", archive.name, candidates.len());
    for target in candidates {
        match ZippedShapefile::open(&archive, &target) {
            Ok(mut shapefile) => {
                let encoding = shapefile
                    .guess_encoding()
                    .map(|e| format!("{e:?}"))
                    .unwrap_or_else(|e| e.to_string());
                let prj = match shapefile.read_prj() {
                    Ok(Some(_)) => "yes",
                    Ok(None) => "no",
                    Err(_) => "unreadable",
                };
                println!("  {target}: encoding={encoding} prj={prj}");
            }
            Err(e) => println!("  {target}: {e}"),
        }
    }
    Ok(())
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("SHP2GP_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("shp2gp"));
            }
        }
    }

    None
}

fn print_help() {
    println!(
        r#"shp2gp_inspect

Looks inside zipped Shapefile archives and manages the converter's app data directory.

Usage:
  cargo run --bin shp2gp_inspect -- --archive data.zip
  cargo run --bin shp2gp_inspect -- --settings --base-dir ./appdata
  cargo run --bin shp2gp_inspect -- --prune-logs

Options:
  --base-dir <path>      Override base dir (default: $SHP2GP_BASE_DIR, or %APPDATA%\shp2gp on Windows)
  --archive <zip>        List the .shp datasets in a ZIP file (repeatable)
  --settings             Print the effective conversion settings
  --download-dir <path>  Set the download directory ("" resets to the default)
  --prune-logs           Remove conversion logs past the retention window
"#
    );
}
