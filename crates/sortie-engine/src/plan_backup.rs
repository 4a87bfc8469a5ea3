//! Versioned backups of every file the implementation plan names.
//!
//! At the PLANNING -> BUILDING boundary the plan file is parsed for file
//! references; each referenced file that exists gets a `.v<N>` copy in
//! the per-mission backup directory so a botched build can roll back.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::Result;

/// Versions kept per file before the oldest rotates out
const MAX_VERSIONS_PER_FILE: u32 = 5;

static BACKTICK_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"`([\w./\-]+\.[A-Za-z0-9]{1,8})`").unwrap()
});
static BARE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*[-*]?\s*(?:File|Create|Modify|Update)?:?\s*([\w./\-]*/[\w.\-]+\.[A-Za-z0-9]{1,8})\s*$").unwrap()
});

/// Extract file references from an implementation plan.
pub fn parse_plan_for_files(plan_path: &Path) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(plan_path) else {
        return Vec::new();
    };

    let mut files = Vec::new();
    for captures in BACKTICK_PATH.captures_iter(&content) {
        let path = captures[1].to_string();
        if !files.contains(&path) {
            files.push(path);
        }
    }
    for captures in BARE_PATH.captures_iter(&content) {
        let path = captures[1].to_string();
        if !files.contains(&path) {
            files.push(path);
        }
    }
    files
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub mission_id: String,
    pub backed_up: Vec<String>,
    pub missing: Vec<String>,
}

fn backup_name(file: &Path, version: u32) -> String {
    format!(
        "{}.v{}",
        file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        version
    )
}

fn existing_versions(backup_dir: &Path, file: &Path) -> Vec<u32> {
    let Some(stem) = file.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return Vec::new();
    };
    let prefix = format!("{}.v", stem);
    let mut versions: Vec<u32> = std::fs::read_dir(backup_dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix(&prefix)
                .and_then(|v| v.parse().ok())
        })
        .collect();
    versions.sort_unstable();
    versions
}

/// Copy one file into the mission's backup directory as the next
/// version, rotating out the oldest beyond the cap.
pub fn backup_file(
    file_path: &Path,
    backups_root: &Path,
    mission_id: &str,
) -> Result<Option<PathBuf>> {
    if !file_path.exists() {
        return Ok(None);
    }

    let backup_dir = backups_root.join(mission_id);
    std::fs::create_dir_all(&backup_dir)?;

    let versions = existing_versions(&backup_dir, file_path);
    let next = versions.last().map(|v| v + 1).unwrap_or(1);
    let target = backup_dir.join(backup_name(file_path, next));
    std::fs::copy(file_path, &target)?;

    // Rotate the oldest out once over the cap
    if versions.len() as u32 + 1 > MAX_VERSIONS_PER_FILE {
        let excess = versions.len() as u32 + 1 - MAX_VERSIONS_PER_FILE;
        for version in versions.into_iter().take(excess as usize) {
            let _ = std::fs::remove_file(backup_dir.join(backup_name(file_path, version)));
        }
    }

    Ok(Some(target))
}

/// Back up every file the plan names, resolved against the workspace.
pub fn backup_planned_files(
    workspace: &Path,
    backups_root: &Path,
    mission_id: &str,
) -> Result<BackupReport> {
    let plan_path = workspace.join("artifacts").join("implementation_plan.md");
    let mut report = BackupReport {
        mission_id: mission_id.to_string(),
        backed_up: Vec::new(),
        missing: Vec::new(),
    };

    for reference in parse_plan_for_files(&plan_path) {
        let candidate = workspace.join(&reference);
        match backup_file(&candidate, backups_root, mission_id)? {
            Some(_) => report.backed_up.push(reference),
            None => report.missing.push(reference),
        }
    }

    if !report.backed_up.is_empty() {
        tracing::info!(mission = mission_id, count = report.backed_up.len(),
            "plan files backed up");
    }
    Ok(report)
}

/// Restore a file from its latest (or a specific) backup version.
pub fn restore_from_backup(
    file_path: &Path,
    backups_root: &Path,
    mission_id: &str,
    version: Option<u32>,
) -> Result<bool> {
    let backup_dir = backups_root.join(mission_id);
    let versions = existing_versions(&backup_dir, file_path);
    let Some(&latest) = versions.last() else {
        return Ok(false);
    };

    let version = version.unwrap_or(latest);
    let source = backup_dir.join(backup_name(file_path, version));
    if !source.exists() {
        return Ok(false);
    }

    if let Some(parent) = file_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&source, file_path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_plan_extracts_backticked_paths() {
        let dir = TempDir::new().unwrap();
        let plan = dir.path().join("implementation_plan.md");
        std::fs::write(
            &plan,
            "# Plan\n\nModify `src/engine.rs` and `src/watcher.rs`.\n\n\
             - src/queue/scheduler.rs\n",
        )
        .unwrap();

        let files = parse_plan_for_files(&plan);
        assert!(files.contains(&"src/engine.rs".to_string()));
        assert!(files.contains(&"src/watcher.rs".to_string()));
        assert!(files.contains(&"src/queue/scheduler.rs".to_string()));
    }

    #[test]
    fn test_backup_versions_increment() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("code.rs");
        let backups = dir.path().join("backups");

        std::fs::write(&target, "v1 content").unwrap();
        backup_file(&target, &backups, "mission_x").unwrap().unwrap();
        std::fs::write(&target, "v2 content").unwrap();
        backup_file(&target, &backups, "mission_x").unwrap().unwrap();

        let versions = existing_versions(&backups.join("mission_x"), &target);
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn test_rotation_caps_versions() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("code.rs");
        let backups = dir.path().join("backups");

        for i in 0..8 {
            std::fs::write(&target, format!("content {}", i)).unwrap();
            backup_file(&target, &backups, "mission_x").unwrap();
        }

        let versions = existing_versions(&backups.join("mission_x"), &target);
        assert_eq!(versions.len() as u32, MAX_VERSIONS_PER_FILE);
        // The oldest versions rotated out
        assert_eq!(versions[0], 4);
    }

    #[test]
    fn test_restore_latest() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("code.rs");
        let backups = dir.path().join("backups");

        std::fs::write(&target, "old").unwrap();
        backup_file(&target, &backups, "mission_x").unwrap();
        std::fs::write(&target, "broken").unwrap();

        assert!(restore_from_backup(&target, &backups, "mission_x", None).unwrap());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "old");
    }

    #[test]
    fn test_backup_planned_files_reports_missing() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(workspace.join("artifacts")).unwrap();
        std::fs::create_dir_all(workspace.join("src")).unwrap();
        std::fs::write(workspace.join("src/real.rs"), "content").unwrap();
        std::fs::write(
            workspace.join("artifacts/implementation_plan.md"),
            "Touch `src/real.rs` and `src/ghost.rs`.",
        )
        .unwrap();

        let report =
            backup_planned_files(&workspace, &dir.path().join("backups"), "mission_x")
                .unwrap();
        assert_eq!(report.backed_up, vec!["src/real.rs".to_string()]);
        assert_eq!(report.missing, vec!["src/ghost.rs".to_string()]);
    }
}
