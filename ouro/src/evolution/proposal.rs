//! Self-improvement proposals and their state machine.
//!
//! A proposal moves `draft → pending_review → approved → deployed`, with
//! `rejected` and `rolled_back` as terminal side exits. The transition
//! methods are the only way to mutate `status`, and each enforces its
//! guards: review needs a non-empty change set, approval needs passing
//! tests plus an approver plus a risk assessment plus a rollback plan, and
//! deployment is reachable only from `approved`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::EvolutionError;

/// Assessed blast radius of a proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

/// Lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    PendingReview,
    Approved,
    Rejected,
    Deployed,
    RolledBack,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::PendingReview => "pending_review",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Deployed => "deployed",
            ProposalStatus::RolledBack => "rolled_back",
        }
    }
}

/// One file write in a proposal's change set. Paths are relative to the
/// environment's storage root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub new_content: String,
}

/// Captured result of a test run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Pre-image of one file, captured during promotion for rollback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollbackStep {
    pub path: String,
    /// `None` means the file did not exist before the deploy.
    pub previous_content: Option<String>,
}

/// Everything needed to restore prod to its pre-deploy state: file
/// pre-images plus any config/migration notes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
    pub notes: String,
}

/// A candidate self-improvement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub file_changes: Vec<FileChange>,
    pub test_results: Option<TestResults>,
    pub risk: Option<Risk>,
    pub estimated_downtime_min: u32,
    pub rollback_plan: Option<RollbackPlan>,
    pub status: ProposalStatus,
    /// Epoch ms.
    pub created_at: i64,
    pub approved_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub deployed_at: Option<i64>,
    pub deployed_by: Option<String>,
    /// Prod revision this proposal was built against.
    pub base_revision: Option<String>,
}

impl Proposal {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            file_changes: Vec::new(),
            test_results: None,
            risk: None,
            estimated_downtime_min: 0,
            rollback_plan: None,
            status: ProposalStatus::Draft,
            created_at: chrono::Utc::now().timestamp_millis(),
            approved_by: None,
            rejection_reason: None,
            deployed_at: None,
            deployed_by: None,
            base_revision: None,
        }
    }

    fn invalid(&self, to: ProposalStatus, reason: impl Into<String>) -> EvolutionError {
        EvolutionError::InvalidTransition {
            from: self.status.as_str(),
            to: to.as_str(),
            reason: reason.into(),
        }
    }

    /// `draft → pending_review`; requires a complete, non-empty change set.
    pub fn submit_for_review(&mut self) -> Result<(), EvolutionError> {
        if self.status != ProposalStatus::Draft {
            return Err(self.invalid(ProposalStatus::PendingReview, "not a draft"));
        }
        if self.file_changes.is_empty() {
            return Err(self.invalid(ProposalStatus::PendingReview, "change set is empty"));
        }
        self.status = ProposalStatus::PendingReview;
        Ok(())
    }

    /// Records a test run; allowed in any pre-deploy state.
    pub fn record_tests(&mut self, results: TestResults) {
        self.test_results = Some(results);
    }

    /// `pending_review → approved`. Requires passing tests, an approver, a
    /// risk assessment, and a rollback plan.
    pub fn approve(&mut self, approver: impl Into<String>) -> Result<(), EvolutionError> {
        if self.status != ProposalStatus::PendingReview {
            return Err(self.invalid(ProposalStatus::Approved, "not pending review"));
        }
        match &self.test_results {
            None => return Err(self.invalid(ProposalStatus::Approved, "no test results")),
            Some(t) if !t.passed => {
                return Err(self.invalid(ProposalStatus::Approved, "tests did not pass"))
            }
            Some(_) => {}
        }
        if self.risk.is_none() {
            return Err(self.invalid(ProposalStatus::Approved, "no risk assessment"));
        }
        if self.rollback_plan.is_none() {
            return Err(self.invalid(ProposalStatus::Approved, "no rollback plan"));
        }
        let approver = approver.into();
        if approver.trim().is_empty() {
            return Err(self.invalid(ProposalStatus::Approved, "approver identity required"));
        }
        self.approved_by = Some(approver);
        self.status = ProposalStatus::Approved;
        Ok(())
    }

    /// `pending_review → rejected`; a reason is mandatory.
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), EvolutionError> {
        if self.status != ProposalStatus::PendingReview {
            return Err(self.invalid(ProposalStatus::Rejected, "not pending review"));
        }
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(self.invalid(ProposalStatus::Rejected, "rejection reason required"));
        }
        self.rejection_reason = Some(reason);
        self.status = ProposalStatus::Rejected;
        Ok(())
    }

    /// `approved → deployed`; called by promotion after the prod swap.
    pub fn mark_deployed(&mut self, deployed_by: impl Into<String>) -> Result<(), EvolutionError> {
        if self.status != ProposalStatus::Approved {
            return Err(self.invalid(ProposalStatus::Deployed, "not approved"));
        }
        self.deployed_by = Some(deployed_by.into());
        self.deployed_at = Some(chrono::Utc::now().timestamp_millis());
        self.status = ProposalStatus::Deployed;
        Ok(())
    }

    /// `deployed → rolled_back`.
    pub fn mark_rolled_back(&mut self) -> Result<(), EvolutionError> {
        if self.status != ProposalStatus::Deployed {
            return Err(self.invalid(ProposalStatus::RolledBack, "not deployed"));
        }
        self.status = ProposalStatus::RolledBack;
        Ok(())
    }
}

/// JSON-file persistence for proposals, one document per id.
pub struct ProposalStore {
    dir: PathBuf,
}

impl ProposalStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, EvolutionError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| EvolutionError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn save(&self, proposal: &Proposal) -> Result<(), EvolutionError> {
        let json = serde_json::to_string_pretty(proposal)
            .map_err(|e| EvolutionError::Io(e.to_string()))?;
        let path = self.path_for(&proposal.id);
        write_atomic(&path, json.as_bytes()).map_err(|e| EvolutionError::Io(e.to_string()))
    }

    pub fn load(&self, id: &str) -> Result<Option<Proposal>, EvolutionError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| EvolutionError::Io(e.to_string()))?;
        let proposal =
            serde_json::from_str(&content).map_err(|e| EvolutionError::Io(e.to_string()))?;
        Ok(Some(proposal))
    }

    pub fn list(&self) -> Result<Vec<Proposal>, EvolutionError> {
        let mut out = Vec::new();
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| EvolutionError::Io(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| EvolutionError::Io(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content =
                std::fs::read_to_string(&path).map_err(|e| EvolutionError::Io(e.to_string()))?;
            match serde_json::from_str::<Proposal>(&content) {
                Ok(p) => out.push(p),
                Err(e) => tracing::warn!("skipping unreadable proposal {path:?}: {e}"),
            }
        }
        out.sort_by_key(|p| p.created_at);
        Ok(out)
    }
}

/// Write-then-rename so a crash never leaves a half-written document.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
