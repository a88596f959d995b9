//! Import of legacy `FaceRecords/` folders.
//!
//! Layout: one folder per person, holding `details.json` (`{"name", "age",
//! "gender", ...}`) and `embedding.json` (DeepFace `represent()` output).
//! The folder name becomes the identity id. Folders missing either file are
//! skipped, as are folders whose files do not parse.

use roster_core::{parse_represent_output, Embedding, Profile};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const DETAILS_FILE: &str = "details.json";
const EMBEDDING_FILE: &str = "embedding.json";

#[derive(Debug)]
pub struct ImportEntry {
    pub id: String,
    pub profile: Profile,
    pub embedding: Embedding,
}

#[derive(Debug, Default)]
pub struct Scan {
    pub entries: Vec<ImportEntry>,
    /// Folders that could not be imported, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Read every person folder under `dir`, ordered by folder name.
pub fn scan_face_records(dir: &Path) -> std::io::Result<Scan> {
    let mut folders: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    folders.sort();

    let mut scan = Scan::default();
    for folder in folders {
        match read_folder(&folder) {
            Ok(entry) => scan.entries.push(entry),
            Err(reason) => {
                tracing::warn!(folder = %folder.display(), %reason, "skipping folder");
                scan.skipped.push((folder, reason));
            }
        }
    }
    Ok(scan)
}

fn read_folder(folder: &Path) -> Result<ImportEntry, String> {
    let id = folder
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or("folder name is not valid UTF-8")?
        .to_string();

    let details_path = folder.join(DETAILS_FILE);
    let embedding_path = folder.join(EMBEDDING_FILE);
    if !details_path.is_file() || !embedding_path.is_file() {
        return Err(format!("needs both {DETAILS_FILE} and {EMBEDDING_FILE}"));
    }

    let details = std::fs::read_to_string(&details_path).map_err(|e| e.to_string())?;
    let details: Map<String, Value> =
        serde_json::from_str(&details).map_err(|e| format!("{DETAILS_FILE}: {e}"))?;
    let profile = profile_from_details(&id, details);

    let raw = std::fs::read_to_string(&embedding_path).map_err(|e| e.to_string())?;
    let embedding = parse_represent_output(&raw).map_err(|e| format!("{EMBEDDING_FILE}: {e}"))?;

    Ok(ImportEntry {
        id,
        profile,
        embedding,
    })
}

/// `name` becomes the display name; every other non-null field an attribute.
fn profile_from_details(id: &str, details: Map<String, Value>) -> Profile {
    let mut profile = Profile::new(id);
    for (key, value) in details {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            other => other.to_string(),
        };
        if key == "name" {
            if !text.trim().is_empty() {
                profile.display_name = text;
            }
        } else {
            profile.attributes.insert(key, text);
        }
    }
    profile
}
