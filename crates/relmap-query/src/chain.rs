//! Tree walker chain: an ordered list of walker types applied to one query.
//!
//! The chain stores walker *types*. Instances are built only when iteration
//! reaches their position, from the query text, the parser result and the
//! components accumulated by the walkers before them. Each position is built
//! at most once per traversal.

use crate::ast::Statement;
use crate::components::QueryComponents;
use crate::output::SqlOutput;
use crate::parser::ParserResult;
use crate::walker::{TreeWalker, WalkerInput, WalkerType};
use relmap_core::{Dialect, Error};

/// Ordered walker types plus the components context they share.
#[derive(Debug, Clone)]
pub struct TreeWalkerChain {
    walkers: Vec<WalkerType>,
    components: QueryComponents,
}

impl TreeWalkerChain {
    /// A chain sharing `components`, usually a copy of the parser's.
    pub fn new(components: QueryComponents) -> Self {
        Self {
            walkers: Vec::new(),
            components,
        }
    }

    pub fn push(&mut self, walker: WalkerType) {
        self.walkers.push(walker);
    }

    /// Insert at `index`; an index past the end appends.
    pub fn insert(&mut self, index: usize, walker: WalkerType) {
        let index = index.min(self.walkers.len());
        self.walkers.insert(index, walker);
    }

    pub fn remove(&mut self, index: usize) -> Option<WalkerType> {
        (index < self.walkers.len()).then(|| self.walkers.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&WalkerType> {
        self.walkers.get(index)
    }

    pub fn len(&self) -> usize {
        self.walkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.walkers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.walkers.iter().map(WalkerType::name).collect()
    }

    pub fn components(&self) -> &QueryComponents {
        &self.components
    }

    /// Start a traversal.
    pub fn iter<'a>(
        &'a mut self,
        query: &'a str,
        dialect: Dialect,
        parser_result: &'a ParserResult,
    ) -> TreeWalkerChainIterator<'a> {
        let instances = self.walkers.iter().map(|_| None).collect();
        TreeWalkerChainIterator {
            walkers: &self.walkers,
            components: &mut self.components,
            query,
            dialect,
            parser_result,
            position: 0,
            instances,
            constructed: 0,
        }
    }

    /// Run every walker in order and return the terminal walker's output.
    #[tracing::instrument(level = "debug", skip_all, fields(walkers = self.walkers.len()))]
    pub fn walk(
        &mut self,
        query: &str,
        dialect: Dialect,
        parser_result: &ParserResult,
    ) -> Result<Option<SqlOutput>, Error> {
        let statement = parser_result.statement();
        let mut iter = self.iter(query, dialect, parser_result);
        let mut output = None;
        while iter.valid() {
            if let Some(produced) = iter.walk_current(statement)? {
                output = Some(produced);
            }
            iter.advance();
        }
        Ok(output)
    }
}

/// Forward-only iterator over a chain's walkers.
pub struct TreeWalkerChainIterator<'a> {
    walkers: &'a [WalkerType],
    components: &'a mut QueryComponents,
    query: &'a str,
    dialect: Dialect,
    parser_result: &'a ParserResult,
    position: usize,
    instances: Vec<Option<Box<dyn TreeWalker>>>,
    constructed: usize,
}

impl TreeWalkerChainIterator<'_> {
    /// Current position, `None` once past the end.
    pub fn key(&self) -> Option<usize> {
        self.valid().then_some(self.position)
    }

    pub fn valid(&self) -> bool {
        self.position < self.walkers.len()
    }

    /// Number of walkers built so far in this traversal.
    pub fn constructed(&self) -> usize {
        self.constructed
    }

    fn ensure_constructed(&mut self) {
        let Some(&walker_type) = self.walkers.get(self.position) else {
            return;
        };
        if self.instances[self.position].is_some() {
            return;
        }
        let input = WalkerInput {
            query: self.query,
            dialect: self.dialect,
            parser_result: self.parser_result,
            components: &*self.components,
        };
        tracing::trace!(walker = walker_type.name(), position = self.position, "Constructing walker");
        let walker = walker_type.construct(&input);
        self.instances[self.position] = Some(walker);
        self.constructed += 1;
    }

    /// The walker at the current position, built on first request.
    pub fn current(&mut self) -> Option<&mut (dyn TreeWalker + 'static)> {
        self.ensure_constructed();
        self.instances
            .get_mut(self.position)
            .and_then(Option::as_deref_mut)
    }

    /// Move forward one position and return the walker there.
    pub fn advance(&mut self) -> Option<&mut (dyn TreeWalker + 'static)> {
        if self.position < self.walkers.len() {
            self.position += 1;
        }
        self.current()
    }

    /// Run the current walker over `statement` with the shared components.
    pub fn walk_current(&mut self, statement: &Statement) -> Result<Option<SqlOutput>, Error> {
        self.ensure_constructed();
        match self.instances.get_mut(self.position) {
            Some(Some(walker)) => walker.walk(statement, self.components),
            _ => Ok(None),
        }
    }
}
