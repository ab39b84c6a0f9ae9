//! Promotion mechanics: staged writes, atomic swap, rollback.
//!
//! Changes are written into a staging directory under the prod storage root,
//! pre-images captured, and only then swapped into place file by file via
//! rename. Any error during the swap restores what was already swapped and
//! discards staging, leaving prod untouched. A smoke check after the swap
//! can trigger automatic rollback.

use std::path::{Component, Path};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::memory::sha256_hex_bytes;

use super::environment::Environment;
use super::proposal::{write_atomic, FileChange, Proposal, RollbackPlan, RollbackStep};
use super::EvolutionError;

/// Post-deploy health probe; failure triggers rollback.
#[async_trait]
pub trait SmokeCheck: Send + Sync {
    async fn check(&self, env: &Environment) -> Result<(), String>;
}

/// Content revision of an environment's storage tree: SHA-256 over the
/// sorted list of `(relative path, file hash)`. Staging and proposal
/// artifacts are excluded so the revision reflects deployed content only.
pub fn revision_of(env: &Environment) -> Result<String, EvolutionError> {
    let mut entries: Vec<(String, String)> = Vec::new();
    collect_files(&env.storage_path, &env.storage_path, &mut entries)?;
    entries.sort();
    let mut manifest = String::new();
    for (path, hash) in &entries {
        manifest.push_str(path);
        manifest.push('\0');
        manifest.push_str(hash);
        manifest.push('\n');
    }
    Ok(sha256_hex_bytes(manifest.as_bytes()))
}

fn excluded(name: &str) -> bool {
    name.starts_with(".staging-") || name == "proposals" || name.ends_with(".tmp")
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, String)>,
) -> Result<(), EvolutionError> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| EvolutionError::Io(e.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|e| EvolutionError::Io(e.to_string()))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if excluded(&name) {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let bytes = std::fs::read(&path).map_err(|e| EvolutionError::Io(e.to_string()))?;
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            out.push((rel, sha256_hex_bytes(&bytes)));
        }
    }
    Ok(())
}

/// The working tree is clean when no staging leftovers exist.
pub fn verify_clean(env: &Environment) -> Result<(), EvolutionError> {
    if !env.storage_path.exists() {
        return Ok(());
    }
    let entries =
        std::fs::read_dir(&env.storage_path).map_err(|e| EvolutionError::Io(e.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|e| EvolutionError::Io(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(".staging-") {
            return Err(EvolutionError::Conflict(format!(
                "prod working tree not clean: leftover {name}"
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_change_path(raw: &str) -> Result<&Path, EvolutionError> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(EvolutionError::Conflict(format!(
            "change path must be relative: {raw}"
        )));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir | Component::Prefix(_) | Component::RootDir) {
            return Err(EvolutionError::Conflict(format!(
                "change path escapes the storage root: {raw}"
            )));
        }
    }
    Ok(path)
}

/// Applies a proposal's change set to prod. Returns the rollback plan built
/// from pre-images. On any error prod is left as it was.
pub fn deploy_changes(
    prod: &Environment,
    proposal: &Proposal,
) -> Result<RollbackPlan, EvolutionError> {
    verify_clean(prod)?;
    if let Some(base) = &proposal.base_revision {
        let current = revision_of(prod)?;
        if *base != current {
            return Err(EvolutionError::Conflict(format!(
                "base revision mismatch: proposal built against {base}, prod is at {current}"
            )));
        }
    }

    std::fs::create_dir_all(&prod.storage_path).map_err(|e| EvolutionError::Io(e.to_string()))?;
    let staging = prod.storage_path.join(format!(".staging-{}", proposal.id));

    let result = stage_and_swap(prod, proposal, &staging);
    if result.is_err() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result
}

fn stage_and_swap(
    prod: &Environment,
    proposal: &Proposal,
    staging: &Path,
) -> Result<RollbackPlan, EvolutionError> {
    // Stage every file and capture pre-images before touching prod.
    let mut plan = RollbackPlan {
        steps: Vec::new(),
        notes: format!("pre-deploy state for proposal {}", proposal.id),
    };
    for change in &proposal.file_changes {
        let rel = validate_change_path(&change.path)?;
        let staged = staging.join(rel);
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EvolutionError::Io(e.to_string()))?;
        }
        std::fs::write(&staged, change.new_content.as_bytes())
            .map_err(|e| EvolutionError::Io(e.to_string()))?;

        let target = prod.storage_path.join(rel);
        let previous_content = match std::fs::read_to_string(&target) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(EvolutionError::Io(e.to_string())),
        };
        plan.steps.push(RollbackStep {
            path: change.path.clone(),
            previous_content,
        });
    }

    // Swap staged files into place; undo on the first error.
    let mut swapped: Vec<usize> = Vec::new();
    for (i, change) in proposal.file_changes.iter().enumerate() {
        let rel = validate_change_path(&change.path)?;
        let staged = staging.join(rel);
        let target = prod.storage_path.join(rel);
        let swap = (|| -> std::io::Result<()> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&staged, &target)
        })();
        match swap {
            Ok(()) => swapped.push(i),
            Err(e) => {
                warn!("swap failed at {}; restoring prod: {e}", change.path);
                for &j in swapped.iter().rev() {
                    restore_step(prod, &plan.steps[j]);
                }
                return Err(EvolutionError::Io(format!(
                    "deploy aborted at {}: {e}",
                    change.path
                )));
            }
        }
    }

    let _ = std::fs::remove_dir_all(staging);
    info!(proposal = proposal.id.as_str(), files = plan.steps.len(), "deployed to prod");
    Ok(plan)
}

fn restore_step(prod: &Environment, step: &RollbackStep) {
    let target = prod.storage_path.join(&step.path);
    let result = match &step.previous_content {
        Some(content) => write_atomic(&target, content.as_bytes()),
        None => match std::fs::remove_file(&target) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    };
    if let Err(e) = result {
        warn!("rollback of {} failed: {e}", step.path);
    }
}

/// Restores prod to the pre-deploy state recorded in the plan.
pub fn roll_back(prod: &Environment, plan: &RollbackPlan) -> Result<(), EvolutionError> {
    for step in &plan.steps {
        let rel = validate_change_path(&step.path)?;
        let target = prod.storage_path.join(rel);
        match &step.previous_content {
            Some(content) => write_atomic(&target, content.as_bytes())
                .map_err(|e| EvolutionError::Io(e.to_string()))?,
            None => match std::fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EvolutionError::Io(e.to_string())),
            },
        }
    }
    info!(files = plan.steps.len(), "prod rolled back");
    Ok(())
}
