//! The tree walker capability and walker type registration.

use crate::ast::Statement;
use crate::components::QueryComponents;
use crate::output::SqlOutput;
use crate::parser::ParserResult;
use relmap_core::{Dialect, Error};
use std::fmt;

/// The fixed inputs every walker is constructed from.
#[derive(Debug, Clone, Copy)]
pub struct WalkerInput<'a> {
    /// Original query text.
    pub query: &'a str,
    pub dialect: Dialect,
    pub parser_result: &'a ParserResult,
    /// Components as left by the walkers that ran before this one.
    pub components: &'a QueryComponents,
}

/// A traversal over a parsed statement.
///
/// Intermediate walkers validate or annotate `components` and return
/// `Ok(None)`; the terminal walker returns the generated SQL.
pub trait TreeWalker: Send {
    fn name(&self) -> &str;

    fn walk(
        &mut self,
        statement: &Statement,
        components: &mut QueryComponents,
    ) -> Result<Option<SqlOutput>, Error>;
}

/// Walkers constructible through [`WalkerType::of`].
pub trait ConstructWalker: TreeWalker + Sized + 'static {
    const NAME: &'static str;

    fn construct(input: &WalkerInput<'_>) -> Self;
}

pub type WalkerFactory = for<'a> fn(&WalkerInput<'a>) -> Box<dyn TreeWalker>;

fn construct_boxed<W: ConstructWalker>(input: &WalkerInput<'_>) -> Box<dyn TreeWalker> {
    Box::new(W::construct(input))
}

/// A walker type: a name and the factory that builds an instance.
#[derive(Clone, Copy)]
pub struct WalkerType {
    name: &'static str,
    factory: WalkerFactory,
}

impl WalkerType {
    pub fn new(name: &'static str, factory: WalkerFactory) -> Self {
        Self { name, factory }
    }

    pub fn of<W: ConstructWalker>() -> Self {
        Self {
            name: W::NAME,
            factory: construct_boxed::<W>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn construct(&self, input: &WalkerInput<'_>) -> Box<dyn TreeWalker> {
        (self.factory)(input)
    }
}

impl fmt::Debug for WalkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WalkerType").field(&self.name).finish()
    }
}

impl PartialEq for WalkerType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for WalkerType {}
