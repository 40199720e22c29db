pub mod module;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::LoadError;

pub use registry::{BlueprintRegistry, BlueprintStatus, ReloadOutcome, ReloadResult, VersionState};

pub const SOURCE_EXTENSION: &str = "rhai";

/// Stable path-like blueprint identity, e.g. `npc/rat`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlueprintId(String);

impl BlueprintId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rejects ids that could escape the world directory.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.split('/').all(|segment| {
                !segment.is_empty()
                    && segment != "."
                    && segment != ".."
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            })
    }
}

impl From<&str> for BlueprintId {
    fn from(raw: &str) -> Self {
        let trimmed = raw.trim().trim_start_matches('/');
        let trimmed = trimmed
            .strip_suffix(".rhai")
            .unwrap_or(trimmed)
            .replace('\\', "/");
        Self(trimmed)
    }
}

impl From<String> for BlueprintId {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl fmt::Display for BlueprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct SourceUnit {
    pub blueprint: BlueprintId,
    pub text: String,
    pub modified: SystemTime,
}

/// Where blueprint source text comes from.
pub trait SourceProvider {
    fn read(&self, blueprint: &BlueprintId) -> Result<SourceUnit, LoadError>;

    /// Current modification time, `None` when the source is gone.
    fn modified(&self, blueprint: &BlueprintId) -> Option<SystemTime>;

    fn list(&self) -> Vec<BlueprintId>;
}

/// `<root>/<blueprint id>.rhai` on disk.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, blueprint: &BlueprintId) -> PathBuf {
        self.root
            .join(format!("{}.{SOURCE_EXTENSION}", blueprint.as_str()))
    }

    /// Maps a file under the root back to its blueprint id.
    pub fn blueprint_for_path(&self, path: &Path) -> Option<BlueprintId> {
        blueprint_for_path(&self.root, path)
    }

    fn collect(&self, dir: &Path, out: &mut Vec<BlueprintId>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, out);
            } else if let Some(id) = self.blueprint_for_path(&path) {
                out.push(id);
            }
        }
    }
}

impl SourceProvider for DirectorySource {
    fn read(&self, blueprint: &BlueprintId) -> Result<SourceUnit, LoadError> {
        if !blueprint.is_valid() {
            return Err(LoadError::Source {
                blueprint: blueprint.clone(),
                message: "invalid blueprint id".to_string(),
            });
        }
        let path = self.path_for(blueprint);
        let source_err = |err: std::io::Error| LoadError::Source {
            blueprint: blueprint.clone(),
            message: format!("{}: {err}", path.display()),
        };
        let text = std::fs::read_to_string(&path).map_err(source_err)?;
        let modified = std::fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map_err(source_err)?;
        Ok(SourceUnit {
            blueprint: blueprint.clone(),
            text,
            modified,
        })
    }

    fn modified(&self, blueprint: &BlueprintId) -> Option<SystemTime> {
        if !blueprint.is_valid() {
            return None;
        }
        std::fs::metadata(self.path_for(blueprint))
            .and_then(|meta| meta.modified())
            .ok()
    }

    fn list(&self) -> Vec<BlueprintId> {
        let mut out = Vec::new();
        self.collect(&self.root, &mut out);
        out.sort();
        out
    }
}

pub fn blueprint_for_path(root: &Path, path: &Path) -> Option<BlueprintId> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(SOURCE_EXTENSION) {
        return None;
    }
    let relative = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.with_extension("").components() {
        match component {
            Component::Normal(part) => segments.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    let id = BlueprintId::from(segments.join("/"));
    id.is_valid().then_some(id)
}

/// In-memory sources with a fake clock: every `set` moves the
/// modification time forward by one second.
#[derive(Clone, Default)]
pub struct MemorySource {
    files: BTreeMap<BlueprintId, (String, u64)>,
    revision: u64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, blueprint: &str, text: &str) -> Self {
        self.set(blueprint, text);
        self
    }

    pub fn set(&mut self, blueprint: &str, text: &str) {
        self.revision += 1;
        self.files
            .insert(BlueprintId::from(blueprint), (text.to_string(), self.revision));
    }

    pub fn remove(&mut self, blueprint: &str) {
        self.files.remove(&BlueprintId::from(blueprint));
    }

    fn stamp(revision: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(revision)
    }
}

impl SourceProvider for MemorySource {
    fn read(&self, blueprint: &BlueprintId) -> Result<SourceUnit, LoadError> {
        let (text, revision) = self.files.get(blueprint).ok_or_else(|| LoadError::Source {
            blueprint: blueprint.clone(),
            message: "no such source".to_string(),
        })?;
        Ok(SourceUnit {
            blueprint: blueprint.clone(),
            text: text.clone(),
            modified: Self::stamp(*revision),
        })
    }

    fn modified(&self, blueprint: &BlueprintId) -> Option<SystemTime> {
        self.files
            .get(blueprint)
            .map(|(_, revision)| Self::stamp(*revision))
    }

    fn list(&self) -> Vec<BlueprintId> {
        self.files.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_normalize_and_validate() {
        assert_eq!(BlueprintId::from("/npc/rat.rhai").as_str(), "npc/rat");
        assert!(BlueprintId::from("npc/rat").is_valid());
        assert!(!BlueprintId::from("../etc/passwd").is_valid());
        assert!(!BlueprintId::from("npc//rat").is_valid());
        assert!(!BlueprintId::from("").is_valid());
    }

    #[test]
    fn memory_source_advances_modification_time() {
        let mut source = MemorySource::new().with("npc/rat", "fn on_load() {}");
        let id = BlueprintId::from("npc/rat");
        let first = source.modified(&id).expect("present");
        source.set("npc/rat", "fn on_load() { }");
        assert!(source.modified(&id).expect("present") > first);
        assert!(source.read(&BlueprintId::from("npc/bat")).is_err());
    }

    #[test]
    fn directory_source_reads_and_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("npc")).expect("mkdir");
        std::fs::write(dir.path().join("npc/rat.rhai"), "fn on_load() {}").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let source = DirectorySource::new(dir.path());
        assert_eq!(source.list(), vec![BlueprintId::from("npc/rat")]);
        let unit = source.read(&BlueprintId::from("npc/rat")).expect("read");
        assert!(unit.text.contains("on_load"));
        assert!(source.read(&BlueprintId::from("npc/bat")).is_err());
        assert!(source.read(&BlueprintId::from("../escape")).is_err());
        assert_eq!(
            source.blueprint_for_path(&dir.path().join("npc/rat.rhai")),
            Some(BlueprintId::from("npc/rat"))
        );
    }
}
