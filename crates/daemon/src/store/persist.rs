// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot persistence with numbered additive migrations.
//!
//! The whole store is one JSON document, saved atomically (temp file +
//! fsync + rename) so a crash mid-save never corrupts the previous
//! snapshot. A snapshot that fails to parse is rotated to `.bak` and the
//! store starts empty with a surfaced warning; destructive migrations are
//! not a thing: every migration step only adds or defaults fields.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::types::{PrRecord, ReviewComment, SessionRecord, Settings, WorktreeRecord};
use super::StoreError;

/// Current snapshot schema. Bumped once per released migration step.
pub const SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionRecord>,
    #[serde(default)]
    pub worktrees: BTreeMap<String, WorktreeRecord>,
    /// Keyed by `repo#number`.
    #[serde(default)]
    pub prs: BTreeMap<String, PrRecord>,
    #[serde(default)]
    pub comments: BTreeMap<String, ReviewComment>,
    #[serde(default)]
    pub settings: Option<Settings>,
}

/// Outcome of loading a snapshot from disk.
pub struct Loaded {
    pub snapshot: Snapshot,
    /// Human-readable anomalies to surface as warnings.
    pub warnings: Vec<String>,
}

/// Load the snapshot, applying migrations as needed.
pub fn load(path: &Path) -> Result<Loaded, StoreError> {
    let mut warnings = Vec::new();

    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Loaded { snapshot: fresh(), warnings });
        }
        Err(e) => return Err(StoreError::Io(e)),
    };

    let mut value: Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(e) => {
            let bak = rotate_bak(path);
            warn!(path = %path.display(), bak = %bak.display(), error = %e, "corrupt store snapshot, starting empty");
            warnings.push(format!("store snapshot was corrupt and moved to {}", bak.display()));
            return Ok(Loaded { snapshot: fresh(), warnings });
        }
    };

    let from = value.get("schema_version").and_then(Value::as_u64).unwrap_or(1) as u32;
    if from > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew { found: from, supported: SCHEMA_VERSION });
    }
    for step in from..SCHEMA_VERSION {
        migrate_step(step, &mut value);
    }
    if let Some(obj) = value.as_object_mut() {
        obj.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
    }

    match serde_json::from_value(value) {
        Ok(snapshot) => Ok(Loaded { snapshot, warnings }),
        Err(e) => {
            let bak = rotate_bak(path);
            warn!(path = %path.display(), bak = %bak.display(), error = %e, "unreadable store snapshot after migration, starting empty");
            warnings.push(format!("store snapshot was unreadable and moved to {}", bak.display()));
            Ok(Loaded { snapshot: fresh(), warnings })
        }
    }
}

/// Apply the migration that lifts `version` to `version + 1`.
fn migrate_step(version: u32, value: &mut Value) {
    match version {
        // v1 → v2: sessions gained `muted`; older snapshots default false.
        1 => {
            if let Some(sessions) = value.get_mut("sessions").and_then(Value::as_object_mut) {
                for session in sessions.values_mut() {
                    if let Some(obj) = session.as_object_mut() {
                        obj.entry("muted").or_insert(Value::Bool(false));
                    }
                }
            }
        }
        // v2 → v3: settings gained `autoskip_patterns`.
        2 => {
            if let Some(settings) = value.get_mut("settings").and_then(Value::as_object_mut) {
                settings.entry("autoskip_patterns").or_insert(Value::Array(vec![]));
            }
        }
        _ => {}
    }
}

/// Save atomically: temp sibling, fsync, rename.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        let payload = serde_json::to_vec_pretty(snapshot)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn fresh() -> Snapshot {
    Snapshot { schema_version: SCHEMA_VERSION, ..Snapshot::default() }
}

fn rotate_bak(path: &Path) -> std::path::PathBuf {
    let bak = path.with_extension("json.bak");
    let _ = fs::rename(path, &bak);
    bak
}
