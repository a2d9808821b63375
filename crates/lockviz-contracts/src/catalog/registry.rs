use std::path::{Path, PathBuf};

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

const DEFAULT_CATALOG_JSON: &str = include_str!("../../resources/lock_catalog.json");

pub const CATALOG_PATH_ENV: &str = "LOCKVIZ_CATALOG_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReference {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub image_url: String,
}

/// Immutable lock catalog, ordered as listed in the source JSON.
#[derive(Debug, Clone)]
pub struct LockCatalog {
    locks: IndexMap<String, LockReference>,
}

impl LockCatalog {
    pub fn new(locks: Option<IndexMap<String, LockReference>>) -> Self {
        Self {
            locks: locks.unwrap_or_else(default_locks),
        }
    }

    /// Bundled catalog merged with the file named by `LOCKVIZ_CATALOG_PATH`, if any.
    pub fn load() -> anyhow::Result<Self> {
        let mut locks = default_locks();
        if let Some(path) = catalog_override_path() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading catalog {}", path.display()))?;
            merge_catalog_rows(&mut locks, &raw)
                .with_context(|| format!("invalid catalog {}", path.display()))?;
        }
        Ok(Self { locks })
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let mut locks = IndexMap::new();
        merge_catalog_rows(&mut locks, raw)?;
        Ok(Self { locks })
    }

    pub fn get(&self, id: &str) -> Option<&LockReference> {
        self.locks.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &LockReference> {
        self.locks.values()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn default_lock(&self) -> Option<&LockReference> {
        self.locks.values().next()
    }
}

fn default_locks() -> IndexMap<String, LockReference> {
    let mut locks = IndexMap::new();
    if merge_catalog_rows(&mut locks, DEFAULT_CATALOG_JSON).is_err() {
        locks.clear();
    }
    locks
}

fn catalog_override_path() -> Option<PathBuf> {
    let raw = std::env::var(CATALOG_PATH_ENV).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(Path::new(trimmed).to_path_buf())
}

fn merge_catalog_rows(
    locks: &mut IndexMap<String, LockReference>,
    raw: &str,
) -> anyhow::Result<()> {
    let rows: Vec<LockReference> =
        serde_json::from_str(raw).context("catalog must be a JSON array of locks")?;
    for row in rows {
        let id = row.id.trim().to_string();
        if id.is_empty() {
            anyhow::bail!("catalog entry '{}' has an empty id", row.name);
        }
        locks.insert(id.clone(), LockReference { id, ..row });
    }
    Ok(())
}
