//! Dev/prod evolution loop.
//!
//! Proposals are built and tested against the writable dev environment and
//! reach prod only through the promotion pipeline: review, passing tests,
//! human approval, staged atomic deploy, smoke check, rollback on failure.

mod environment;
mod promote;
mod proposal;
mod test_run;

pub use environment::{EnvKind, Environment, EnvironmentPair};
pub use promote::{deploy_changes, revision_of, roll_back, verify_clean, SmokeCheck};
pub use proposal::{
    FileChange, Proposal, ProposalStatus, ProposalStore, Risk, RollbackPlan, RollbackStep,
    TestResults,
};
pub use test_run::run_tests;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Evolution loop failures.
#[derive(Debug, Error)]
pub enum EvolutionError {
    /// Dev/prod isolation violated; startup refuses to continue.
    #[error("environment isolation: {0}")]
    Isolation(String),
    /// A proposal transition guard rejected the move.
    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
        reason: String,
    },
    /// Prod state does not match what the proposal was built against.
    #[error("promotion conflict: {0}")]
    Conflict(String),
    #[error("smoke check failed: {0}")]
    SmokeFailed(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(String),
}

/// The evolution loop: environment pair, proposal store, promotion.
/// One per process.
pub struct EvolutionLoop {
    envs: EnvironmentPair,
    proposals: ProposalStore,
}

impl EvolutionLoop {
    /// Verifies isolation and opens the proposal store under the dev
    /// storage root.
    pub fn new(envs: EnvironmentPair) -> Result<Self, EvolutionError> {
        envs.verify()?;
        let proposals = ProposalStore::open(envs.dev.storage_path.join("proposals"))?;
        Ok(Self { envs, proposals })
    }

    pub fn from_config(cfg: &env_config::EnvsConfig) -> Result<Self, EvolutionError> {
        Self::new(EnvironmentPair::from_config(cfg)?)
    }

    pub fn dev(&self) -> &Environment {
        &self.envs.dev
    }

    pub fn prod(&self) -> &Environment {
        &self.envs.prod
    }

    pub fn proposals(&self) -> &ProposalStore {
        &self.proposals
    }

    /// Starts a draft proposal pinned to prod's current revision.
    pub fn create_proposal(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Proposal, EvolutionError> {
        let mut proposal = Proposal::new(title, description);
        proposal.base_revision = Some(revision_of(&self.envs.prod)?);
        self.proposals.save(&proposal)?;
        Ok(proposal)
    }

    /// Applies a proposal's change set to the dev environment so it can be
    /// built and tested there. Dev is the only writable side.
    pub fn apply_to_dev(&self, proposal: &Proposal) -> Result<(), EvolutionError> {
        std::fs::create_dir_all(&self.envs.dev.storage_path)
            .map_err(|e| EvolutionError::Io(e.to_string()))?;
        for change in &proposal.file_changes {
            let rel = promote::validate_change_path(&change.path)?;
            let target = self.envs.dev.storage_path.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| EvolutionError::Io(e.to_string()))?;
            }
            proposal::write_atomic(&target, change.new_content.as_bytes())
                .map_err(|e| EvolutionError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// Runs the dev test suite and records the result on the proposal.
    pub async fn run_dev_tests(
        &self,
        proposal: &mut Proposal,
        cancel: &CancellationToken,
    ) -> Result<(), EvolutionError> {
        let results = run_tests(&self.envs.dev, cancel).await?;
        proposal.record_tests(results);
        self.proposals.save(proposal)?;
        Ok(())
    }

    pub fn submit_for_review(&self, proposal: &mut Proposal) -> Result<(), EvolutionError> {
        proposal.submit_for_review()?;
        self.proposals.save(proposal)?;
        Ok(())
    }

    pub fn approve(
        &self,
        proposal: &mut Proposal,
        approver: &str,
    ) -> Result<(), EvolutionError> {
        proposal.approve(approver)?;
        self.proposals.save(proposal)?;
        Ok(())
    }

    pub fn reject(&self, proposal: &mut Proposal, reason: &str) -> Result<(), EvolutionError> {
        proposal.reject(reason)?;
        self.proposals.save(proposal)?;
        Ok(())
    }

    /// Promotes an approved proposal to prod: staged atomic deploy, then an
    /// optional smoke check with automatic rollback on failure. The captured
    /// pre-images replace the plan's steps so rollback restores exactly what
    /// the deploy displaced.
    pub async fn promote(
        &self,
        proposal: &mut Proposal,
        deployed_by: &str,
        smoke: Option<&dyn SmokeCheck>,
    ) -> Result<(), EvolutionError> {
        if proposal.status != ProposalStatus::Approved {
            return Err(EvolutionError::InvalidTransition {
                from: proposal.status.as_str(),
                to: ProposalStatus::Deployed.as_str(),
                reason: "only approved proposals deploy".to_string(),
            });
        }

        let captured = deploy_changes(&self.envs.prod, proposal)?;
        let notes = proposal
            .rollback_plan
            .as_ref()
            .map(|p| p.notes.clone())
            .unwrap_or_default();
        proposal.rollback_plan = Some(RollbackPlan {
            steps: captured.steps.clone(),
            notes,
        });
        proposal.mark_deployed(deployed_by)?;
        self.proposals.save(proposal)?;

        if let Some(check) = smoke {
            if let Err(reason) = check.check(&self.envs.prod).await {
                info!(proposal = proposal.id.as_str(), "smoke check failed; rolling back");
                roll_back(&self.envs.prod, &captured)?;
                proposal.mark_rolled_back()?;
                self.proposals.save(proposal)?;
                return Err(EvolutionError::SmokeFailed(reason));
            }
        }
        Ok(())
    }

    /// Rolls back a deployed proposal using its recorded plan.
    pub fn roll_back_deployed(&self, proposal: &mut Proposal) -> Result<(), EvolutionError> {
        if proposal.status != ProposalStatus::Deployed {
            return Err(EvolutionError::InvalidTransition {
                from: proposal.status.as_str(),
                to: ProposalStatus::RolledBack.as_str(),
                reason: "only deployed proposals roll back".to_string(),
            });
        }
        let plan = proposal.rollback_plan.clone().ok_or_else(|| {
            EvolutionError::Config("deployed proposal has no rollback plan".to_string())
        })?;
        roll_back(&self.envs.prod, &plan)?;
        proposal.mark_rolled_back()?;
        self.proposals.save(proposal)?;
        Ok(())
    }
}
