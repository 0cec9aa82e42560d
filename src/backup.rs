use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const BUNDLE_FORMAT_V1: &str = "hostel-workspace-v1";

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/hostel.sqlite3";
const DB_FILE: &str = "hostel.sqlite3";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    db_sha256: String,
    #[serde(default)]
    db_bytes: u64,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    exported_at: String,
    #[serde(default)]
    source_workspace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub db_sha256: String,
}

/// Passes bytes through to `inner` and digests them on the way.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        let digest = self.hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        (hex, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Zips the workspace database with a manifest carrying its sha256.
///
/// The database is hashed while it is streamed into the archive, so the
/// manifest always describes the bytes that were actually written.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        bail!("workspace database not found: {}", db_path.display());
    }
    if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create bundle {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    let mut sink = HashingWriter::new(&mut zip);
    io::copy(&mut db_file, &mut sink).context("failed to write database entry")?;
    let (db_sha256, db_bytes) = sink.finish();

    let manifest = Manifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        db_sha256: db_sha256.clone(),
        db_bytes,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        source_workspace: Some(workspace_path.to_string_lossy().to_string()),
    };
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    serde_json::to_writer_pretty(&mut zip, &manifest).context("failed to write manifest")?;
    zip.finish().context("failed to finalize bundle")?;

    Ok(ExportSummary {
        bundle_format: manifest.format,
        entry_count: 2,
        db_sha256,
        db_bytes,
    })
}

fn has_zip_signature(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    Ok(read == 4 && sig == [0x50, 0x4B, 0x03, 0x04])
}

fn read_manifest<R: Read + io::Seek>(archive: &mut ZipArchive<R>) -> anyhow::Result<Manifest> {
    let entry = archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?;
    serde_json::from_reader(entry).context("manifest.json is invalid")
}

/// Writes the database entry to `staged` and returns its digest.
fn extract_db<R: Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    staged: &Path,
) -> anyhow::Result<String> {
    let mut entry = archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {}", DB_ENTRY))?;
    let out = File::create(staged)
        .with_context(|| format!("failed to create {}", staged.display()))?;
    let mut sink = HashingWriter::new(out);
    io::copy(&mut entry, &mut sink).context("failed to extract database entry")?;
    sink.flush().context("failed to flush extracted database")?;
    Ok(sink.finish().0)
}

/// Restores the database from a bundle. The caller must have closed its
/// connection to the workspace database first. Nothing in the workspace is
/// touched until the extracted bytes match the manifest.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    if !has_zip_signature(in_path)? {
        bail!("not a workspace bundle: {}", in_path.display());
    }
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;
    let manifest = read_manifest(&mut archive)?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        bail!("unsupported bundle format: {}", manifest.format);
    }

    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;
    let staged = workspace_path.join(format!("{}.importing", DB_FILE));
    let actual = match extract_db(&mut archive, &staged) {
        Ok(sha) => sha,
        Err(e) => {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }
    };
    if actual != manifest.db_sha256 {
        let _ = std::fs::remove_file(&staged);
        bail!(
            "database checksum mismatch: manifest {} vs extracted {}",
            manifest.db_sha256,
            actual
        );
    }

    let dst = workspace_path.join(DB_FILE);
    if dst.exists() {
        std::fs::remove_file(&dst)
            .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
    }
    // Journal files left by the old database must not be replayed onto the new one.
    for suffix in ["-wal", "-shm", "-journal"] {
        let _ = std::fs::remove_file(workspace_path.join(format!("{}{}", DB_FILE, suffix)));
    }
    std::fs::rename(&staged, &dst)
        .with_context(|| format!("failed to move restored database to {}", dst.display()))?;

    Ok(ImportSummary {
        bundle_format_detected: manifest.format,
        db_sha256: actual,
    })
}
