use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::MissionError;

pub const MISSION_EXT: &str = ".waypoints";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Mtime,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl std::str::FromStr for SortKey {
    type Err = MissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(SortKey::Name),
            "mtime" | "modified" => Ok(SortKey::Mtime),
            "size" => Ok(SortKey::Size),
            other => Err(MissionError::Validation(format!("unknown sort key: {}", other))),
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = MissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(MissionError::Validation(format!("unknown sort order: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub exts: Vec<String>,
    pub recursive: bool,
    pub sort: SortKey,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            exts: vec![MISSION_EXT.to_string()],
            recursive: false,
            sort: SortKey::Mtime,
            order: SortOrder::Desc,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionFile {
    pub name: String,
    /// Path relative to the listed base directory, `/`-separated.
    pub path: String,
    pub size: u64,
    pub modified_unix_s: i64,
}

fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') { ext } else { format!(".{}", ext) }
}

pub fn has_mission_extension(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(MISSION_EXT)
}

/// Uploaded or referenced mission files must carry the mission extension.
pub fn ensure_mission_extension(name: &str) -> Result<(), MissionError> {
    if has_mission_extension(name) {
        Ok(())
    } else {
        Err(MissionError::Validation(format!("mission file must end with {}: {}", MISSION_EXT, name)))
    }
}

/// Relative names live under the missions directory unless they already
/// point into it.
pub fn resolve(missions_dir: &Path, name: &str) -> PathBuf {
    let p = Path::new(name);
    if p.is_absolute() || p.starts_with(missions_dir) {
        p.to_path_buf()
    } else {
        missions_dir.join(p)
    }
}

/// Mission file resolved under `missions_dir` that must already exist.
pub fn existing(missions_dir: &Path, name: &str) -> Result<PathBuf, MissionError> {
    ensure_mission_extension(name)?;
    let path = resolve(missions_dir, name);
    if path.is_file() { Ok(path) } else { Err(MissionError::FileNotFound(path)) }
}

pub fn list_missions(base_dir: &Path, opts: &ListOptions) -> Result<Vec<MissionFile>, MissionError> {
    if !base_dir.is_dir() {
        return Ok(Vec::new());
    }
    let exts: Vec<String> = opts.exts.iter().map(|e| normalize_ext(e)).collect();
    let mut files = Vec::new();
    walk(base_dir, base_dir, &exts, opts.recursive, &mut files)?;

    files.sort_by(|a, b| match opts.sort {
        SortKey::Name => a.path.cmp(&b.path),
        SortKey::Mtime => a.modified_unix_s.cmp(&b.modified_unix_s).then_with(|| a.path.cmp(&b.path)),
        SortKey::Size => a.size.cmp(&b.size).then_with(|| a.path.cmp(&b.path)),
    });
    if opts.order == SortOrder::Desc {
        files.reverse();
    }
    if let Some(limit) = opts.limit {
        files.truncate(limit);
    }
    Ok(files)
}

fn walk(
    base: &Path,
    dir: &Path,
    exts: &[String],
    recursive: bool,
    out: &mut Vec<MissionFile>,
) -> Result<(), MissionError> {
    let entries = fs::read_dir(dir).map_err(|e| MissionError::io(dir, e))?;
    for ent in entries {
        let ent = ent.map_err(|e| MissionError::io(dir, e))?;
        let path = ent.path();
        let meta = ent.metadata().map_err(|e| MissionError::io(&path, e))?;

        if meta.is_dir() {
            if recursive {
                walk(base, &path, exts, recursive, out)?;
            }
            continue;
        }

        let name = ent.file_name().to_string_lossy().into_owned();
        let lower = name.to_ascii_lowercase();
        if !exts.iter().any(|e| lower.ends_with(e.as_str())) {
            continue;
        }

        let modified_unix_s = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let rel = path.strip_prefix(base).unwrap_or(&path);
        let rel = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");

        out.push(MissionFile { name, path: rel, size: meta.len(), modified_unix_s });
    }
    Ok(())
}
