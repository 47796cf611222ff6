//! Core extraction pipeline for mcpextract.
//!
//! This crate turns fetched [`SourceBundle`](mcpextract_shared::SourceBundle)s
//! into scored server configurations: prompt construction and the model call
//! ([`generator`]), structural checks ([`validator`]), confidence scoring
//! ([`aggregator`]), and the batch driver that ties them to a fetcher and a
//! record store ([`orchestrator`]).

pub mod aggregator;
pub mod generator;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod sources;
pub mod validator;

pub use aggregator::{ConfidenceAggregator, Scored};
pub use generator::{ConfigGenerator, parse_model_output};
pub use llm::{ModelClient, ModelRequest, ModelResponse, build_client};
pub use orchestrator::{
    AttentionItem, BatchOrchestrator, BatchProgress, BatchState, BatchSummary, SilentProgress,
    SourceState,
};
pub use sources::{load_sources, parse_source_list};
pub use validator::validate;
