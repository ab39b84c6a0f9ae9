//! Dev/prod environments and isolation verification.
//!
//! Two environments per process: a writable dev environment where proposals
//! are applied and tested, and a prod environment the agent treats as
//! read-only (only promotion writes there). Startup refuses a pair that
//! shares a database, a storage root, or a port.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::EvolutionError;

/// Which side of the promotion boundary an environment sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvKind {
    Dev,
    Prod,
}

impl std::fmt::Display for EnvKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvKind::Dev => f.write_str("dev"),
            EnvKind::Prod => f.write_str("prod"),
        }
    }
}

/// One isolated environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Environment {
    pub kind: EnvKind,
    pub database_path: PathBuf,
    pub storage_path: PathBuf,
    pub ports: BTreeSet<u16>,
    pub env_vars: BTreeMap<String, String>,
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<u8>,
    pub test_command: Option<String>,
    pub test_timeout: Duration,
}

impl Environment {
    pub fn from_config(kind: EnvKind, cfg: &env_config::EnvConfig) -> Self {
        Self {
            kind,
            database_path: cfg.db_path.clone(),
            storage_path: cfg.storage_path.clone(),
            ports: cfg.ports.clone(),
            env_vars: cfg.env_vars.clone(),
            max_memory_mb: cfg.resource_limits.max_memory_mb,
            max_cpu_percent: cfg.resource_limits.max_cpu_percent,
            test_command: cfg.test_command.clone(),
            test_timeout: Duration::from_millis(cfg.test_timeout_ms.unwrap_or(300_000)),
        }
    }

    /// The agent may write here only on the dev side.
    pub fn writable(&self) -> bool {
        self.kind == EnvKind::Dev
    }
}

/// The verified dev/prod pair.
#[derive(Clone, Debug)]
pub struct EnvironmentPair {
    pub dev: Environment,
    pub prod: Environment,
}

impl EnvironmentPair {
    /// Builds and verifies the pair; startup refuses a non-isolated config.
    pub fn new(dev: Environment, prod: Environment) -> Result<Self, EvolutionError> {
        let pair = Self { dev, prod };
        pair.verify()?;
        Ok(pair)
    }

    pub fn from_config(cfg: &env_config::EnvsConfig) -> Result<Self, EvolutionError> {
        Self::new(
            Environment::from_config(EnvKind::Dev, &cfg.dev),
            Environment::from_config(EnvKind::Prod, &cfg.prod),
        )
    }

    /// Isolation invariants: database paths differ, storage roots differ,
    /// port sets are disjoint.
    pub fn verify(&self) -> Result<(), EvolutionError> {
        if self.dev.database_path == self.prod.database_path {
            return Err(EvolutionError::Isolation(format!(
                "dev and prod share a database: {}",
                self.dev.database_path.display()
            )));
        }
        if self.dev.storage_path == self.prod.storage_path {
            return Err(EvolutionError::Isolation(format!(
                "dev and prod share a storage root: {}",
                self.dev.storage_path.display()
            )));
        }
        let shared: Vec<u16> = self.dev.ports.intersection(&self.prod.ports).copied().collect();
        if !shared.is_empty() {
            return Err(EvolutionError::Isolation(format!(
                "dev and prod share ports: {shared:?}"
            )));
        }
        if self.dev.max_memory_mb.is_none() && self.dev.max_cpu_percent.is_none() {
            tracing::warn!("dev environment has no resource ceilings configured");
        }
        Ok(())
    }
}
