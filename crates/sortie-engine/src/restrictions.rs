//! Per-stage write restrictions over the mission workspace.
//!
//! Before each invocation the engine installs a guard descriptor naming
//! the permitted roots for the stage; engine-side writes are checked
//! against the same table and fail early when they land outside it.
//!
//! | Stage     | Permitted writes                              |
//! |-----------|-----------------------------------------------|
//! | PLANNING  | workspace/artifacts, workspace/research       |
//! | BUILDING  | full workspace                                |
//! | TESTING   | full workspace                                |
//! | ANALYZING | workspace/reports/analysis                    |
//! | CYCLE_END | workspace/artifacts/cycle_reports             |
//! | COMPLETE  | read-only                                     |

use std::path::{Component, Path, PathBuf};

use serde_json::json;

use sortie_types::{now_iso, Stage};

use crate::error::{Error, Result};

/// Workspace-relative roots a stage may write under. An empty-string
/// root means the whole workspace; an empty list means read-only.
pub fn permitted_roots(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Planning => &["artifacts", "research"],
        Stage::Building | Stage::Testing => &[""],
        Stage::Analyzing => &["reports/analysis"],
        Stage::CycleEnd => &["artifacts/cycle_reports"],
        Stage::Complete => &[],
    }
}

/// Installed write-restriction guard for one stage run.
pub struct WriteGuard {
    workspace: PathBuf,
    stage: Stage,
}

impl WriteGuard {
    /// Install the guard: create the permitted roots and write the
    /// descriptor the external LLM process reads.
    pub fn install(workspace: &Path, stage: Stage) -> Result<Self> {
        std::fs::create_dir_all(workspace)?;
        for root in permitted_roots(stage) {
            if !root.is_empty() {
                std::fs::create_dir_all(workspace.join(root))?;
            }
        }

        let descriptor = json!({
            "stage": stage.as_str(),
            "permitted_roots": permitted_roots(stage),
            "installed_at": now_iso(),
        });
        std::fs::write(
            workspace.join(".write_guard.json"),
            serde_json::to_vec_pretty(&descriptor)?,
        )?;

        Ok(WriteGuard { workspace: workspace.to_path_buf(), stage })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Check a target path against the stage's permitted roots. The path
    /// may be workspace-relative or absolute under the workspace; `..`
    /// components and escapes from the workspace are rejected outright.
    pub fn check(&self, target: &Path) -> Result<()> {
        let relative = if target.is_absolute() {
            target.strip_prefix(&self.workspace).map_err(|_| Error::Restricted {
                stage: self.stage.as_str().to_string(),
                path: target.display().to_string(),
            })?
        } else {
            target
        };

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::Restricted {
                        stage: self.stage.as_str().to_string(),
                        path: target.display().to_string(),
                    })
                }
            }
        }

        let roots = permitted_roots(self.stage);
        let allowed = roots.iter().any(|root| {
            if root.is_empty() {
                true
            } else {
                normalized.starts_with(root)
            }
        });

        if allowed {
            Ok(())
        } else {
            Err(Error::Restricted {
                stage: self.stage.as_str().to_string(),
                path: target.display().to_string(),
            })
        }
    }

    /// Write a file after checking it against the restriction table.
    pub fn guarded_write(&self, relative_path: &Path, contents: &[u8]) -> Result<()> {
        self.check(relative_path)?;
        let full = self.workspace.join(relative_path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, contents)?;
        Ok(())
    }
}
