//! Answers free-text grocery price questions.
//!
//! A question is classified into a [`QueryIntent`], turned into a
//! [`QuerySpec`] and run by an [`Executor`]. [`QueryOrchestrator`] ties these
//! together behind a time-bounded answer cache and reports every call to an
//! [`AuditLogger`].

pub mod audit;
pub mod catalog;
pub mod config;
pub mod executor;
pub mod intent;
pub mod orchestrator;
pub mod query_spec;

pub use crate::{
    audit::{
        AuditLogger, AuditRecord, CompositeAuditLogger, LogAuditLogger, MemoryAuditLog, QueryStats,
    },
    catalog::{CatalogSummary, MemoryCatalog, PriceRecord},
    config::{Config, Environment},
    executor::{ExecutionError, Executor, ResultRow},
    intent::{QueryIntent, classify},
    orchestrator::{QueryEnvelope, QueryOrchestrator, QueryOrchestratorBuilder},
    query_spec::{Direction, Field, Predicate, QuerySpec, SortKey, build},
};
