use anyhow::{anyhow, Context};
use rusqlite::Connection;
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::DB_FILE_NAME;
use crate::error::{AppError, AppResult};
use crate::roster;

const MANIFEST_ENTRY: &str = "manifest.json";
const ROSTER_DIR: &str = "rosters";
pub const ARCHIVE_FORMAT_V1: &str = "gradebook-rosters-v1";
/// Workspace subdirectory that receives every exported archive.
pub const EXPORT_DIR: &str = "exports";

/// Resolve an export file name to `<workspace>/exports/<file_name>`.
///
/// Only a bare `.zip` file name is accepted: no directories, no absolute
/// paths, no `..`, and nothing that could name the workspace database.
pub fn export_path(workspace: &Path, file_name: &str) -> AppResult<PathBuf> {
    let name = file_name.trim();
    let reject = |reason: &str| {
        AppError::validation(format!("invalid file_name: {reason}"))
            .with_details(json!({ "file_name": file_name }))
    };
    if name.is_empty() {
        return Err(reject("must not be empty"));
    }
    if name.contains(['/', '\\', ':', '\0']) || name == "." || name == ".." {
        return Err(reject("must be a bare file name"));
    }
    if name.to_ascii_lowercase().starts_with(DB_FILE_NAME) {
        return Err(reject("reserved for the workspace database"));
    }
    if !name.to_ascii_lowercase().ends_with(".zip") || name.len() == ".zip".len() {
        return Err(reject("must end with .zip"));
    }
    Ok(workspace.join(EXPORT_DIR).join(name))
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub archive_format: String,
    pub roster_count: usize,
    pub entry_count: usize,
}

fn roster_entry(roster_id: &str) -> String {
    format!("{ROSTER_DIR}/{roster_id}.json")
}

/// Write every stored roster (optionally one academic year) into a zip
/// archive: `manifest.json` plus `rosters/<id>.json` per roster.
pub fn export_rosters(
    conn: &Connection,
    out_path: &Path,
    academic_year_id: Option<&str>,
) -> anyhow::Result<ExportSummary> {
    let rosters = roster::load_rosters(conn, academic_year_id, None)
        .map_err(|e| anyhow!("failed to load rosters: {e}"))?;

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

    let entries: Vec<serde_json::Value> = rosters
        .iter()
        .map(|(summary, _)| {
            json!({
                "entry": roster_entry(&summary.roster_id),
                "roster": summary,
            })
        })
        .collect();
    let manifest = json!({
        "format": ARCHIVE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "academicYearId": academic_year_id,
        "rosters": entries,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    for (summary, payload) in &rosters {
        let entry = roster_entry(&summary.roster_id);
        zip.start_file(entry.as_str(), opts)
            .with_context(|| format!("failed to start entry {entry}"))?;
        // Stored text is written as-is so the recorded digest still matches it.
        zip.write_all(payload.as_bytes())
            .with_context(|| format!("failed to write entry {entry}"))?;
    }

    zip.finish().context("failed to finalize roster archive")?;

    tracing::info!(
        path = %out_path.to_string_lossy(),
        rosters = rosters.len(),
        "exported roster archive"
    );

    Ok(ExportSummary {
        archive_format: ARCHIVE_FORMAT_V1.to_string(),
        roster_count: rosters.len(),
        entry_count: rosters.len() + 1,
    })
}

/// Re-read an archive and check each roster entry against the digest in the
/// manifest. Returns the number of rosters verified.
pub fn verify_archive(in_path: &Path) -> anyhow::Result<usize> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open archive {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("archive missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != ARCHIVE_FORMAT_V1 {
        return Err(anyhow!("unsupported archive format: {}", format));
    }

    let entries = manifest
        .get("rosters")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for item in &entries {
        let entry = item
            .get("entry")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest roster without entry name"))?;
        let expected = item
            .pointer("/roster/payload_sha256")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest roster {entry} without digest"))?;
        let mut text = String::new();
        archive
            .by_name(entry)
            .with_context(|| format!("archive missing {entry}"))?
            .read_to_string(&mut text)
            .with_context(|| format!("failed to read {entry}"))?;
        let payload: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("{entry} is invalid JSON"))?;
        let actual = roster::payload_digest(&payload).map_err(|e| anyhow!("{e}"))?;
        if actual != expected {
            return Err(anyhow!("digest mismatch for {entry}"));
        }
    }
    Ok(entries.len())
}
