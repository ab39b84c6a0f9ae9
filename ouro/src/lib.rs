//! # Ouro
//!
//! Orchestration substrate for a self-evolving agent platform. Four tightly
//! coupled subsystems behind one crate:
//!
//! - **Runtime dispatcher** ([`runtime`]): LLM invocation with a two-method
//!   [`Provider`] contract, substring error classification, round-robin
//!   auth-key rotation, and an ordered provider failover chain. Streaming is
//!   a finite, non-restartable delta sequence; failover stops at the first
//!   observed delta.
//! - **Tool pipeline** ([`pipeline`]): a startup-frozen registry plus staged
//!   execution: schema validation, path/URL security checks, token-bucket
//!   rate limiting, a per-tool circuit breaker, timeouts, and metrics. Every
//!   path returns a uniform [`ToolOutcome`]; nothing is thrown at callers.
//! - **Memory engine** ([`memory`]): one SQLite file (relational tables plus
//!   FTS5), append-only JSONL conversation logs as the source of truth, a
//!   content-addressed embedding cache with LRU eviction, and a `notify`
//!   watcher that reconciles index from log by content hash.
//! - **Evolution loop** ([`evolution`]): isolated dev/prod environments and
//!   a proposal state machine gated by tests, risk assessment, and human
//!   approval, with staged atomic promotion and rollback.
//!
//! [`Substrate::initialize`] wires one instance of each from the typed
//! config document; [`chat::ChatTurn`] is the glue that assembles context,
//! dispatches, and serializes tool calls within a turn.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ouro::{Provider, Substrate, ToolRegistry};
//! use ouro::runtime::MockProvider;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = env_config::OuroConfig::load("config.toml")?;
//! let substrate = Substrate::initialize(
//!     &cfg,
//!     vec![Arc::new(MockProvider::new("mock")) as Arc<dyn Provider>],
//!     ToolRegistry::builder().build(),
//! )?;
//!
//! let turn = substrate.chat_turn();
//! let outcome = turn
//!     .run("conv_1", "optimize the authentication module", substrate.cancellation())
//!     .await?;
//! println!("{:?}", outcome.reply);
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod evolution;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod runtime;

mod substrate;

pub use chat::{ChatError, ChatOutcome, ChatTurn, ChatTurnOptions};
pub use evolution::{
    EnvKind, Environment, EnvironmentPair, EvolutionError, EvolutionLoop, Proposal,
    ProposalStatus, Risk,
};
pub use memory::{
    Embedder, EmbeddingCache, MemoryEngine, MemoryError, SearchHit, SearchResponse,
    SemanticResponse, ThresholdPolicy, VectorIndex,
};
pub use message::{Message, Role};
pub use pipeline::{
    Executor, ExecutorFailure, ParamFormat, ParamKind, ParamSchema, ParamSpec, RegistryBuilder,
    ToolCall, ToolErrorCode, ToolOutcome, ToolPipeline, ToolRegistry, ToolSpec,
};
pub use runtime::{
    ApiKey, ChainEntry, DispatchError, Dispatcher, ErrorClass, LlmRequest, LlmResponse, Provider,
    ProviderError,
};
pub use substrate::{InitError, Substrate};
