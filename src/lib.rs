//! # ADO Work-Item MCP Server
//!
//! An MCP (Model Context Protocol) server that mediates between LLM agents
//! and Azure DevOps work-item management.
//!
//! ## Why query handles
//!
//! LLMs hallucinate work-item ids. Every query here can bind its result set
//! to an opaque, short-lived *query handle* (`qh_…`); bulk operations then
//! take a handle plus an *item selector* (`"all"`, an index list, or a
//! criteria object) instead of raw ids. The ids an operation touches are
//! always the ids a real query returned.
//!
//! ## Flow
//!
//! ```text
//! LLM ── query-wiql ──▶ Dispatcher ──▶ Query Executor ──▶ ADO REST
//!                                          │
//!                                          ▼
//!                                    Handle Store  (ids + context snapshot)
//!                                          │ handle id
//! LLM ── execute-bulk-operations ──▶ Selector Resolver ──▶ Bulk Engine ──▶ ADO (batched)
//!                                                               │
//!                                                               ▼
//!                                                         Undo Journal
//! ```
//!
//! ## Architecture
//!
//! - **ado**: authenticated JSON client over ADO REST/Analytics, behind the
//!   [`AdoGateway`] trait (batching, retries, rate gate, call counters)
//! - **auth**: Azure CLI token provider; Analytics gets its own scope
//! - **handles**: the in-memory query handle store (TTL, opaque ids)
//! - **selector**: item selector parsing and resolution
//! - **executor** / **odata**: WIQL and Analytics execution, context
//!   snapshots, staleness enrichment, handle creation
//! - **bulk**: batched mutations with dry-run defaults and undo recording
//! - **undo**: append-only journal and inverse-write engine
//! - **generator**: natural language → validated WIQL/OData via sampling
//! - **dispatch** / **toolset**: schema validation, default merging, the
//!   uniform result envelope, and the public tool surface
//! - **server**: the rmcp stdio server and peer sampling bridge

pub mod ado;
pub mod auth;
pub mod bulk;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod generator;
pub mod handles;
pub mod models;
pub mod odata;
pub mod retry;
pub mod sampling;
pub mod selector;
pub mod server;
pub mod staleness;
pub mod toolset;
pub mod undo;

// --- Core error type ---

pub use error::{Error, Result};

// --- Configuration ---

pub use config::{ServerConfig, ServerConfigBuilder, ToolDefaults};

// --- External seams ---

pub use ado::AdoGateway;
pub use auth::{TokenProvider, TokenScope};
pub use sampling::SamplingClient;

// --- Handle subsystem ---

pub use handles::{HandleSummary, QueryHandle, QueryHandleStore, QueryKind};
pub use selector::{ItemSelector, SelectionCriteria};

// --- Tool surface ---

pub use dispatch::{ArgKind, ArgumentSchema, ToolContext, ToolRegistration, ToolRegistry};
pub use envelope::ToolExecutionResult;
