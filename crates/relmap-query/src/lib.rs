//! Object query translation for relmap.
//!
//! Queries are written against entities and their fields:
//!
//! ```text
//! SELECT u FROM User u JOIN u.group g WHERE g.title = :title AND u.age > 18
//! ```
//!
//! Translation runs in stages:
//!
//! - [`lexer`] turns the text into tokens
//! - [`parser`] builds an immutable [`Statement`] and resolves every alias
//!   into [`QueryComponents`] through a `MetadataProvider`
//! - a [`TreeWalkerChain`] runs walkers over the statement in order; walkers
//!   are constructed lazily and share the components context
//! - the terminal [`SqlWalker`] emits dialect SQL with positional
//!   placeholders and a [`ResultSetMapping`]
//!
//! [`Query`] ties the stages together, binds parameters and caches compiled
//! SQL through a `CacheProvider`.

pub mod ast;
pub mod chain;
pub mod components;
pub mod lexer;
pub mod output;
pub mod parser;
pub mod query;
pub mod sql_walker;
pub mod walker;

pub use ast::{ParameterRef, Statement};
pub use chain::{TreeWalkerChain, TreeWalkerChainIterator};
pub use components::{COUNT_HINT, QueryComponent, QueryComponents};
pub use lexer::{Token, TokenKind, tokenize};
pub use output::{
    EntityResult, FieldResult, ParameterSource, ResultSetMapping, ScalarResult, SqlOutput,
};
pub use parser::{Clause, Parser, ParserPhase, ParserResult, parse};
pub use query::{ParameterKey, Query, QueryResult};
pub use sql_walker::{CountWalker, SqlWalker};
pub use walker::{ConstructWalker, TreeWalker, WalkerFactory, WalkerInput, WalkerType};
