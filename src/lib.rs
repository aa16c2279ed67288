//! Tessera - a declarative tag-based markup language
//!
//! Source files are nested tagged elements. Language tags carry the `q:`
//! prefix (`<q:set>`, `<q:loop>`, `<q:query>`, ...); every other tag is
//! output markup with `{expr}` interpolation.
//!
//! A parsed [`Document`] can be rendered two ways that produce identical
//! output: [`Runtime::render`] walks the tree, while [`compile`] lowers it
//! once into a [`CompiledUnit`] for [`Runtime::render_compiled`]. Both drive
//! the same [`OperationEngine`] for declarative I/O (Query, Data, Fetch,
//! Invoke, Llm).

pub mod ast;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod context;
pub mod directives;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod import;
pub mod interpreter;
pub mod lexer;
pub mod operations;
pub mod parser;
pub mod providers;
pub mod result;
pub mod runtime;
pub mod token_parser;
pub mod transform;
pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

// Re-export commonly used types
pub use ast::{Document, Expression, Node, NodeKind, SourceSpan, Template};
pub use compiler::{compile, CompiledUnit};
pub use config::RuntimeConfig;
pub use context::{ExecutionContext, ScopeKind};
pub use engine::{LiveOperation, OperationEngine, OperationInstance, OperationState};
pub use error::{format_parse_error, format_render_error, ParseError, RenderError};
pub use providers::{
    BufferSink, DatasourceProvider, EchoModel, Fixtures, HttpTransport, MemoryDatasource, ModelProvider,
    OutputSink, Providers, StaticTransport,
};
pub use result::{ErrorKind, OperationError, ResultObject};
pub use runtime::{RenderOutput, RenderRequest, Runtime, RuntimeBuilder};
pub use types::{TypeHint, Value};

/// Parse source text into a validated document
pub fn parse_str(input: &str) -> Result<Document, ParseError> {
    parser::parse(input)
}

/// Parse a file. Errors are prefixed with the file path.
pub fn parse_file(path: &Path) -> Result<Document> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    parser::parse(&source).map_err(|e| {
        anyhow::anyhow!("{}: {}", path.display(), e)
    })
}

/// Tessera version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
