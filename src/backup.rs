use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::DB_FILE_NAME;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/school.sqlite3";
pub const BUNDLE_FORMAT: &str = "schoold-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub db_sha256: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format: String,
    pub exported_at: Option<String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Writes `manifest.json` plus the workspace database into a zip bundle.
/// The manifest records the database checksum so imports can reject
/// truncated or edited bundles.
pub fn export_workspace_bundle(workspace_path: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    let checksum = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": crate::db::now_timestamp(),
        "dbEntry": DB_ENTRY,
        "dbSha256": checksum,
        "dbBytes": db_bytes.len(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;
    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        db_sha256: checksum,
        db_bytes: db_bytes.len() as u64,
    })
}

/// Replaces the workspace database with the one inside `in_path`.
/// Nothing is touched until the manifest and checksum have been verified.
pub fn import_workspace_bundle(in_path: &Path, workspace_path: &Path) -> anyhow::Result<ImportSummary> {
    if !is_zip_file(in_path)? {
        return Err(anyhow!(
            "not a workspace bundle: {}",
            in_path.to_string_lossy()
        ));
    }
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest.json missing dbSha256"))?
        .to_ascii_lowercase();

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .context("bundle missing db/school.sqlite3")?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;
    let actual = sha256_hex(&db_bytes);
    if actual != expected {
        return Err(anyhow!(
            "database checksum mismatch (expected {}, got {})",
            expected,
            actual
        ));
    }

    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(DB_FILE_NAME);
    let tmp_dst = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }
    {
        let mut db_out = File::create(&tmp_dst).with_context(|| {
            format!(
                "failed to create temp database {}",
                tmp_dst.to_string_lossy()
            )
        })?;
        db_out
            .write_all(&db_bytes)
            .context("failed to write extracted database")?;
        db_out
            .flush()
            .context("failed to flush extracted database")?;
    }
    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    Ok(ImportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        exported_at: manifest
            .get("exportedAt")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::path::PathBuf;

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn export_then_import_restores_rows() {
        let src = temp_dir("schoold-backup-src");
        let dst = temp_dir("schoold-backup-dst");
        {
            let conn = db::open_db(&src).unwrap();
            conn.execute(
                "INSERT INTO staff(id, name, designation, status, created_at)
                 VALUES('s1', 'R. Lyngdoh', 'Headmaster', 'active', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }
        let bundle = src.join("out").join("backup.zip");
        let summary = export_workspace_bundle(&src, &bundle).unwrap();
        assert_eq!(summary.bundle_format, BUNDLE_FORMAT);
        assert_eq!(summary.db_sha256.len(), 64);

        import_workspace_bundle(&bundle, &dst).unwrap();
        let conn = db::open_db(&dst).unwrap();
        let name: String = conn
            .query_row("SELECT name FROM staff WHERE id = 's1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "R. Lyngdoh");
    }

    #[test]
    fn import_rejects_checksum_mismatch_and_keeps_existing_db() {
        let ws = temp_dir("schoold-backup-tamper");
        db::open_db(&ws).unwrap();
        let original = std::fs::read(ws.join(DB_FILE_NAME)).unwrap();

        let bundle = ws.join("tampered.zip");
        {
            let mut zip = ZipWriter::new(File::create(&bundle).unwrap());
            let opts = FileOptions::default();
            zip.start_file(MANIFEST_ENTRY, opts).unwrap();
            zip.write_all(
                json!({ "format": BUNDLE_FORMAT, "dbSha256": "00" })
                    .to_string()
                    .as_bytes(),
            )
            .unwrap();
            zip.start_file(DB_ENTRY, opts).unwrap();
            zip.write_all(b"not a database").unwrap();
            zip.finish().unwrap();
        }

        let e = import_workspace_bundle(&bundle, &ws).unwrap_err();
        assert!(e.to_string().contains("checksum mismatch"), "{e}");
        assert_eq!(std::fs::read(ws.join(DB_FILE_NAME)).unwrap(), original);
    }

    #[test]
    fn import_rejects_non_zip_input() {
        let ws = temp_dir("schoold-backup-nonzip");
        let f = ws.join("plain.txt");
        std::fs::write(&f, "hello").unwrap();
        let e = import_workspace_bundle(&f, &ws).unwrap_err();
        assert!(e.to_string().contains("not a workspace bundle"));
    }
}
