//! Directory compression.
//!
//! Both formats walk the export directory recursively in sorted order and store entries under
//! their `/`-separated path relative to the directory. The archive file is synced to disk before
//! its size is reported.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::ArchiveFormat;
use crate::error::{ExporterError, Result};
use crate::orchestration::types::ArchiveInfo;

/// Compress every file under `source` into `destination`.
///
/// Top-level entries named in `exclude` are left out. Runs on the blocking pool.
pub async fn compress_directory(
    source: &Path,
    destination: &Path,
    format: ArchiveFormat,
    exclude: &[&str],
) -> Result<ArchiveInfo> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();

    tokio::task::spawn_blocking(move || {
        compress_directory_blocking(&source, &destination, format, &exclude)
    })
    .await
    .map_err(|e| ExporterError::TaskPanicked(format!("archive task: {e}")))?
}

fn compress_directory_blocking(
    source: &Path,
    destination: &Path,
    format: ArchiveFormat,
    exclude: &[String],
) -> Result<ArchiveInfo> {
    let files = collect_files(source, exclude)
        .map_err(|e| ExporterError::filesystem("scan export directory", source, e))?;

    let output = File::create(destination)
        .map_err(|e| ExporterError::filesystem("create archive", destination, e))?;

    let output = match format {
        ArchiveFormat::Zip => write_zip(output, &files),
        ArchiveFormat::Tar => write_tar(output, &files),
    }
    .map_err(|e| ExporterError::Archive(format!("{}: {e}", destination.display())))?;

    output
        .sync_all()
        .map_err(|e| ExporterError::filesystem("sync archive", destination, e))?;
    let size_bytes = output
        .metadata()
        .map_err(|e| ExporterError::filesystem("stat archive", destination, e))?
        .len();

    debug!(
        archive = %destination.display(),
        format = %format,
        entries = files.len(),
        size_bytes = size_bytes,
        "Archive written"
    );

    Ok(ArchiveInfo {
        path: destination.to_path_buf(),
        size_bytes,
        entries: files.len(),
    })
}

/// `(absolute path, entry name)` for every regular file below `root`, sorted by entry name
fn collect_files(root: &Path, exclude: &[String]) -> io::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if prefix.is_empty() && exclude.iter().any(|e| e == &name) {
                continue;
            }
            let entry_name = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push((entry.path(), entry_name));
            } else if file_type.is_file() {
                files.push((entry.path(), entry_name));
            }
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn write_zip(output: File, files: &[(PathBuf, String)]) -> io::Result<File> {
    let mut writer = ZipWriter::new(output);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for (path, name) in files {
        writer.start_file(name.as_str(), options).map_err(io::Error::other)?;
        let mut input = File::open(path)?;
        io::copy(&mut input, &mut writer)?;
    }

    writer.finish().map_err(io::Error::other)
}

fn write_tar(output: File, files: &[(PathBuf, String)]) -> io::Result<File> {
    let mut builder = tar::Builder::new(output);
    for (path, name) in files {
        builder.append_path_with_name(path, name)?;
    }
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        fs::write(dir.join("patients.0.csv"), "\"1\",\"Ada\"\n").unwrap();
        fs::write(dir.join("visits.1.csv"), "").unwrap();
        fs::write(dir.join("mapping.json"), "[]").unwrap();
        fs::write(dir.join(".exporter-run.json"), "{}").unwrap();
        fs::create_dir(dir.join("nested")).unwrap();
        fs::write(dir.join("nested").join("extra.csv"), "x").unwrap();
    }

    #[tokio::test]
    async fn test_zip_contains_every_file_but_excluded() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("run");
        fs::create_dir(&source).unwrap();
        populate(&source);
        let destination = temp.path().join("run.zip");

        let info = compress_directory(&source, &destination, ArchiveFormat::Zip, &[".exporter-run.json"])
            .await
            .unwrap();
        assert_eq!(info.entries, 4);
        assert_eq!(info.size_bytes, fs::metadata(&destination).unwrap().len());

        let mut archive = zip::ZipArchive::new(File::open(&destination).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["mapping.json", "nested/extra.csv", "patients.0.csv", "visits.1.csv"]
        );

        let mut content = String::new();
        archive
            .by_name("patients.0.csv")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "\"1\",\"Ada\"\n");
    }

    #[tokio::test]
    async fn test_tar_contains_every_file_but_excluded() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("run");
        fs::create_dir(&source).unwrap();
        populate(&source);
        let destination = temp.path().join("run.tar");

        let info = compress_directory(&source, &destination, ArchiveFormat::Tar, &[".exporter-run.json"])
            .await
            .unwrap();
        assert_eq!(info.entries, 4);

        let mut archive = tar::Archive::new(File::open(&destination).unwrap());
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["mapping.json", "nested/extra.csv", "patients.0.csv", "visits.1.csv"]
        );
    }

    #[tokio::test]
    async fn test_missing_source_is_filesystem_error() {
        let temp = TempDir::new().unwrap();
        let err = compress_directory(
            &temp.path().join("absent"),
            &temp.path().join("absent.zip"),
            ArchiveFormat::Zip,
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExporterError::Filesystem { .. }));
        assert!(!temp.path().join("absent.zip").exists());
    }
}
