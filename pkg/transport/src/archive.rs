//! End-of-reservation artifact bundling.
//!
//! Logs and demos collected from a server are packed into one retrievable
//! `<reservation-id>.tar.gz`. Archival is best-effort: a failure here is
//! recorded as a status note, never propagated into the lifecycle flip.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Bundle local files into `dest`, flattened to their file names.
pub fn bundle_files(files: &[PathBuf], dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = std::fs::File::create(dest)
        .with_context(|| format!("creating bundle {}", dest.display()))?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        builder
            .append_path_with_name(file, &name)
            .with_context(|| format!("adding {} to bundle", file.display()))?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Bundle in-memory blobs (artifacts fetched over FTP) into `dest`.
pub fn bundle_bytes(entries: &[(String, Vec<u8>)], dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = std::fs::File::create(dest)?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice())?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Mine an archived bundle for the steam ids of everyone who appears in
/// the logs. Runs as a deferred task after the reservation ended.
pub fn scan_bundle_for_players(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening bundle {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut ids = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let mut text = String::new();
        if entry.read_to_string(&mut text).is_err() {
            continue; // binary demo file
        }
        for id in steam_ids_in(&text) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// Extract every `[U:1:<n>]` token from a block of log text.
pub fn steam_ids_in(text: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("[U:1:") {
        rest = &rest[start..];
        match rest.find(']') {
            Some(end) if rest[5..end].bytes().all(|b| b.is_ascii_digit()) && end > 5 => {
                let id = rest[..=end].to_string();
                if !ids.contains(&id) {
                    ids.push(id);
                }
                rest = &rest[end + 1..];
            }
            Some(end) => rest = &rest[end + 1..],
            None => break,
        }
    }
    ids
}
