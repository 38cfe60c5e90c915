//! Recursive-descent parser producing an immutable [`Statement`].
//!
//! Parsing moves through [`ParserPhase::Lexing`], one
//! [`ParserPhase::Parsing`] phase per clause, and ends in
//! [`ParserPhase::Complete`]. Identification variables are resolved against
//! the [`MetadataProvider`] while the FROM clause is read; every path is
//! checked once the whole statement is known, so SELECT items may refer to
//! aliases declared later in the text.

use crate::ast::{
    AggregateFunction, ArithmeticOp, Assignment, ComparisonOp, Condition, DeleteStatement,
    Expression, Join, JoinKind, Literal, OrderByItem, ParameterRef, PathExpression,
    RangeDeclaration, ScalarFunction, SelectItem, SelectStatement, SortDirection, Statement,
    UpdateStatement,
};
use crate::components::{QueryComponent, QueryComponents};
use crate::lexer::{Token, TokenKind, is_reserved, tokenize};
use relmap_core::{EntityMetadata, Error, MetadataProvider, QuerySyntaxError};
use std::sync::Arc;

/// Clause currently being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Update,
    Set,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserPhase {
    Lexing,
    Parsing(Clause),
    Complete,
}

/// A parsed statement with its resolved aliases and parameters.
#[derive(Debug, Clone)]
pub struct ParserResult {
    statement: Statement,
    components: QueryComponents,
    parameters: Vec<ParameterRef>,
}

impl ParserResult {
    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// Components as resolved by the parser, before any walker ran.
    pub fn components(&self) -> &QueryComponents {
        &self.components
    }

    /// Distinct parameters in order of first appearance.
    pub fn parameters(&self) -> &[ParameterRef] {
        &self.parameters
    }
}

/// Parse `query`, resolving entities through `metadata`.
pub fn parse(query: &str, metadata: &dyn MetadataProvider) -> Result<ParserResult, Error> {
    Parser::new(query, metadata).parse()
}

fn syntax_error(message: impl Into<String>, position: usize, token: impl Into<String>) -> Error {
    QuerySyntaxError::at_token(message, position, token).into()
}

pub struct Parser<'a> {
    query: &'a str,
    metadata: &'a dyn MetadataProvider,
    tokens: Vec<Token>,
    pos: usize,
    phase: ParserPhase,
    components: QueryComponents,
}

impl<'a> Parser<'a> {
    pub fn new(query: &'a str, metadata: &'a dyn MetadataProvider) -> Self {
        Self {
            query,
            metadata,
            tokens: Vec::new(),
            pos: 0,
            phase: ParserPhase::Lexing,
            components: QueryComponents::new(),
        }
    }

    pub fn phase(&self) -> ParserPhase {
        self.phase
    }

    #[tracing::instrument(level = "debug", skip_all, fields(query = %self.query))]
    pub fn parse(mut self) -> Result<ParserResult, Error> {
        self.tokens = tokenize(self.query)?;

        let statement = if self.check_keyword("SELECT") {
            Statement::Select(self.select_statement()?)
        } else if self.check_keyword("UPDATE") {
            Statement::Update(self.update_statement()?)
        } else if self.check_keyword("DELETE") {
            Statement::Delete(self.delete_statement()?)
        } else {
            return Err(self.unexpected("SELECT, UPDATE or DELETE"));
        };
        if self.peek().kind != TokenKind::Eof {
            return Err(self.unexpected("end of query"));
        }

        let expressions = statement_expressions(&statement);
        for (clause, expression) in &expressions {
            let mut result = Ok(());
            expression.for_each_path(&mut |path| {
                if result.is_ok() {
                    result = self.check_path(path, *clause);
                }
            });
            result?;
        }
        if let Statement::Update(update) = &statement {
            for assignment in &update.assignments {
                self.check_assignment(update, assignment)?;
            }
        }

        let mut parameters: Vec<ParameterRef> = Vec::new();
        for (_, expression) in &expressions {
            expression.for_each_parameter(&mut |parameter| {
                if !parameters.contains(parameter) {
                    parameters.push(parameter.clone());
                }
            });
        }

        self.phase = ParserPhase::Complete;
        tracing::debug!(
            kind = statement.kind(),
            aliases = self.components.len(),
            parameters = parameters.len(),
            "Parsed query"
        );
        Ok(ParserResult {
            statement,
            components: self.components,
            parameters,
        })
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        // The token list always ends with Eof and `pos` never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        self.peek().is_keyword(keyword)
    }

    fn accept_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<usize, Error> {
        let position = self.peek().position;
        if self.accept_keyword(keyword) {
            Ok(position)
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn accept(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<usize, Error> {
        let position = self.peek().position;
        if self.accept(kind) {
            Ok(position)
        } else {
            Err(self.unexpected(&format!("'{kind}'")))
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        let token = self.peek();
        syntax_error(
            format!("expected {expected}, found '{}'", token.kind),
            token.position,
            token.kind.to_string(),
        )
    }

    /// A non-reserved identifier.
    fn identifier(&mut self, what: &str) -> Result<(String, usize), Error> {
        match &self.peek().kind {
            TokenKind::Identifier(name) if !is_reserved(name) => {
                let name = name.clone();
                let position = self.advance().position;
                Ok((name, position))
            }
            _ => Err(self.unexpected(what)),
        }
    }

    /// An entity name. Entity names may collide with keywords (`Order`,
    /// `Group`) since their position is unambiguous.
    fn entity_name(&mut self) -> Result<(String, usize), Error> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                let position = self.advance().position;
                Ok((name, position))
            }
            _ => Err(self.unexpected("entity name")),
        }
    }

    fn check_alias(&self) -> bool {
        matches!(&self.peek().kind, TokenKind::Identifier(name) if !is_reserved(name))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn select_statement(&mut self) -> Result<SelectStatement, Error> {
        self.phase = ParserPhase::Parsing(Clause::Select);
        self.expect_keyword("SELECT")?;
        let distinct = self.accept_keyword("DISTINCT");
        let mut items = Vec::new();
        loop {
            let position = self.peek().position;
            let expression = self.expression()?;
            let alias = if self.accept_keyword("AS") || self.check_alias() {
                Some(self.identifier("result alias")?)
            } else {
                None
            };
            items.push((expression, alias, position));
            if !self.accept(&TokenKind::Comma) {
                break;
            }
        }

        self.phase = ParserPhase::Parsing(Clause::From);
        self.expect_keyword("FROM")?;
        let mut from = vec![self.range_declaration()?];
        while self.accept(&TokenKind::Comma) {
            from.push(self.range_declaration()?);
        }

        let items = items
            .into_iter()
            .map(|(expression, alias, position)| {
                if let Some((name, alias_position)) = &alias {
                    self.components.add_result_variable(name, *alias_position)?;
                }
                Ok(SelectItem {
                    expression,
                    alias: alias.map(|(name, _)| name),
                    position,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let where_clause = self.where_clause()?;

        let mut group_by = Vec::new();
        if self.check_keyword("GROUP") {
            self.phase = ParserPhase::Parsing(Clause::GroupBy);
            self.advance();
            self.expect_keyword("BY")?;
            group_by.push(self.expression()?);
            while self.accept(&TokenKind::Comma) {
                group_by.push(self.expression()?);
            }
        }

        let having = if self.check_keyword("HAVING") {
            self.phase = ParserPhase::Parsing(Clause::Having);
            self.advance();
            Some(self.condition()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.check_keyword("ORDER") {
            self.phase = ParserPhase::Parsing(Clause::OrderBy);
            self.advance();
            self.expect_keyword("BY")?;
            loop {
                let expression = self.expression()?;
                let direction = if self.accept_keyword("DESC") {
                    SortDirection::Desc
                } else {
                    self.accept_keyword("ASC");
                    SortDirection::Asc
                };
                order_by.push(OrderByItem {
                    expression,
                    direction,
                });
                if !self.accept(&TokenKind::Comma) {
                    break;
                }
            }
        }

        Ok(SelectStatement {
            distinct,
            items,
            from,
            where_clause,
            group_by,
            having,
            order_by,
        })
    }

    fn where_clause(&mut self) -> Result<Option<Condition>, Error> {
        if self.check_keyword("WHERE") {
            self.phase = ParserPhase::Parsing(Clause::Where);
            self.advance();
            Ok(Some(self.condition()?))
        } else {
            Ok(None)
        }
    }

    fn resolve_entity(&self, entity: &str, position: usize) -> Result<Arc<EntityMetadata>, Error> {
        self.metadata
            .metadata_for(entity)
            .map_err(|_| syntax_error(format!("unknown entity '{entity}'"), position, entity))
    }

    /// `Entity [AS] alias` followed by its joins.
    fn range_declaration(&mut self) -> Result<RangeDeclaration, Error> {
        let (entity, position) = self.entity_name()?;
        let metadata = self.resolve_entity(&entity, position)?;
        self.accept_keyword("AS");
        let (alias, alias_position) = self.identifier("alias")?;
        self.components
            .add(&alias, QueryComponent::root(metadata, alias_position))?;

        let mut joins = Vec::new();
        while self.check_keyword("JOIN") || self.check_keyword("INNER") || self.check_keyword("LEFT") {
            joins.push(self.join()?);
        }
        Ok(RangeDeclaration {
            entity,
            alias,
            joins,
            position,
        })
    }

    fn join(&mut self) -> Result<Join, Error> {
        let position = self.peek().position;
        let kind = if self.accept_keyword("LEFT") {
            self.accept_keyword("OUTER");
            JoinKind::Left
        } else {
            self.accept_keyword("INNER");
            JoinKind::Inner
        };
        self.expect_keyword("JOIN")?;
        let fetch = self.accept_keyword("FETCH");

        let (parent, path_position) = self.identifier("join path")?;
        self.expect(&TokenKind::Dot)?;
        let (association, _) = self.identifier("association name")?;
        let path = PathExpression {
            alias: parent.clone(),
            field: Some(association.clone()),
            position: path_position,
        };

        let parent_metadata = match self.components.get(&parent) {
            Some(component) => Arc::clone(&component.metadata),
            None => {
                return Err(syntax_error(
                    format!("unknown alias '{parent}'"),
                    path_position,
                    parent,
                ));
            }
        };
        let Some(assoc) = parent_metadata.association(&association) else {
            let message = if parent_metadata.field(&association).is_some() {
                format!(
                    "'{association}' is not an association of '{}'",
                    parent_metadata.name()
                )
            } else {
                format!(
                    "unknown association '{association}' on entity '{}'",
                    parent_metadata.name()
                )
            };
            return Err(syntax_error(message, path_position, path.to_string()));
        };
        let target = self.resolve_entity(&assoc.target_entity, path_position)?;

        self.accept_keyword("AS");
        let (alias, alias_position) = self.identifier("join alias")?;
        self.components.add(
            &alias,
            QueryComponent::joined(target, parent, association, fetch, alias_position),
        )?;

        let condition = if self.accept_keyword("WITH") {
            Some(self.condition()?)
        } else {
            None
        };
        Ok(Join {
            kind,
            fetch,
            path,
            alias,
            condition,
            position,
        })
    }

    fn update_statement(&mut self) -> Result<UpdateStatement, Error> {
        self.phase = ParserPhase::Parsing(Clause::Update);
        let position = self.expect_keyword("UPDATE")?;
        let (entity, entity_position) = self.entity_name()?;
        let metadata = self.resolve_entity(&entity, entity_position)?;
        self.accept_keyword("AS");
        let (alias, alias_position) = self.identifier("alias")?;
        self.components
            .add(&alias, QueryComponent::root(metadata, alias_position))?;

        self.phase = ParserPhase::Parsing(Clause::Set);
        self.expect_keyword("SET")?;
        let mut assignments = Vec::new();
        loop {
            let path = self.path()?;
            self.expect(&TokenKind::Equals)?;
            let value = self.expression()?;
            assignments.push(Assignment { path, value });
            if !self.accept(&TokenKind::Comma) {
                break;
            }
        }
        let where_clause = self.where_clause()?;
        Ok(UpdateStatement {
            entity,
            alias,
            assignments,
            where_clause,
            position,
        })
    }

    fn delete_statement(&mut self) -> Result<DeleteStatement, Error> {
        self.phase = ParserPhase::Parsing(Clause::Delete);
        let position = self.expect_keyword("DELETE")?;
        self.accept_keyword("FROM");
        let (entity, entity_position) = self.entity_name()?;
        let metadata = self.resolve_entity(&entity, entity_position)?;
        self.accept_keyword("AS");
        let (alias, alias_position) = self.identifier("alias")?;
        self.components
            .add(&alias, QueryComponent::root(metadata, alias_position))?;
        let where_clause = self.where_clause()?;
        Ok(DeleteStatement {
            entity,
            alias,
            where_clause,
            position,
        })
    }

    // ------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------

    fn condition(&mut self) -> Result<Condition, Error> {
        let mut terms = vec![self.condition_term()?];
        while self.accept_keyword("OR") {
            terms.push(self.condition_term()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::Or(terms)
        })
    }

    fn condition_term(&mut self) -> Result<Condition, Error> {
        let mut factors = vec![self.condition_factor()?];
        while self.accept_keyword("AND") {
            factors.push(self.condition_factor()?);
        }
        Ok(if factors.len() == 1 {
            factors.remove(0)
        } else {
            Condition::And(factors)
        })
    }

    fn condition_factor(&mut self) -> Result<Condition, Error> {
        if self.accept_keyword("NOT") {
            return Ok(Condition::Not(Box::new(self.condition_factor()?)));
        }
        if self.peek().kind == TokenKind::LeftParen {
            // A parenthesized condition, unless the parentheses only group an
            // expression that is then compared
            let start = self.pos;
            self.advance();
            if let Ok(condition) = self.condition() {
                if self.accept(&TokenKind::RightParen) && !self.at_predicate_operator() {
                    return Ok(condition);
                }
            }
            self.pos = start;
        }
        self.predicate()
    }

    fn at_predicate_operator(&self) -> bool {
        let token = self.peek();
        matches!(
            token.kind,
            TokenKind::Equals
                | TokenKind::NotEquals
                | TokenKind::Less
                | TokenKind::LessEquals
                | TokenKind::Greater
                | TokenKind::GreaterEquals
                | TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
        ) || ["IS", "NOT", "BETWEEN", "IN", "LIKE"]
            .iter()
            .any(|kw| token.is_keyword(kw))
    }

    fn predicate(&mut self) -> Result<Condition, Error> {
        let left = self.expression()?;

        let op = match self.peek().kind {
            TokenKind::Equals => Some(ComparisonOp::Eq),
            TokenKind::NotEquals => Some(ComparisonOp::NotEq),
            TokenKind::Less => Some(ComparisonOp::Lt),
            TokenKind::LessEquals => Some(ComparisonOp::LtEq),
            TokenKind::Greater => Some(ComparisonOp::Gt),
            TokenKind::GreaterEquals => Some(ComparisonOp::GtEq),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.expression()?;
            return Ok(Condition::Comparison { left, op, right });
        }

        if self.accept_keyword("IS") {
            let negated = self.accept_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Condition::IsNull {
                expression: left,
                negated,
            });
        }

        let negated = self.accept_keyword("NOT");
        if self.accept_keyword("BETWEEN") {
            let low = self.expression()?;
            self.expect_keyword("AND")?;
            let high = self.expression()?;
            return Ok(Condition::Between {
                expression: left,
                low,
                high,
                negated,
            });
        }
        if self.accept_keyword("IN") {
            self.expect(&TokenKind::LeftParen)?;
            let mut list = vec![self.expression()?];
            while self.accept(&TokenKind::Comma) {
                list.push(self.expression()?);
            }
            self.expect(&TokenKind::RightParen)?;
            return Ok(Condition::In {
                expression: left,
                list,
                negated,
            });
        }
        if self.accept_keyword("LIKE") {
            let pattern = self.expression()?;
            return Ok(Condition::Like {
                expression: left,
                pattern,
                negated,
            });
        }
        Err(self.unexpected("comparison operator"))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expression, Error> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => ArithmeticOp::Add,
                TokenKind::Minus => ArithmeticOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> Result<Expression, Error> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => ArithmeticOp::Mul,
                TokenKind::Slash => ArithmeticOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expression, Error> {
        if self.accept(&TokenKind::Minus) {
            return Ok(match self.unary()? {
                Expression::Literal {
                    value: Literal::Integer(n),
                    position,
                } => Expression::Literal {
                    value: Literal::Integer(-n),
                    position,
                },
                Expression::Literal {
                    value: Literal::Float(n),
                    position,
                } => Expression::Literal {
                    value: Literal::Float(-n),
                    position,
                },
                other => Expression::Negate(Box::new(other)),
            });
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expression, Error> {
        let token = self.peek().clone();
        let position = token.position;
        match token.kind {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(Expression::Literal {
                    value: Literal::Integer(n),
                    position,
                })
            }
            TokenKind::Float(n) => {
                self.advance();
                Ok(Expression::Literal {
                    value: Literal::Float(n),
                    position,
                })
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Expression::Literal {
                    value: Literal::String(s),
                    position,
                })
            }
            TokenKind::NamedParameter(name) => {
                self.advance();
                Ok(Expression::Parameter {
                    parameter: ParameterRef::Named(name),
                    position,
                })
            }
            TokenKind::PositionalParameter(index) => {
                self.advance();
                Ok(Expression::Parameter {
                    parameter: ParameterRef::Positional(index),
                    position,
                })
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&TokenKind::RightParen)?;
                Ok(inner)
            }
            TokenKind::Identifier(name) => {
                let literal = if name.eq_ignore_ascii_case("TRUE") {
                    Some(Literal::Boolean(true))
                } else if name.eq_ignore_ascii_case("FALSE") {
                    Some(Literal::Boolean(false))
                } else if name.eq_ignore_ascii_case("NULL") {
                    Some(Literal::Null)
                } else {
                    None
                };
                if let Some(value) = literal {
                    self.advance();
                    return Ok(Expression::Literal { value, position });
                }
                if self.peek_next().kind == TokenKind::LeftParen {
                    return self.function_call(&name, position);
                }
                if is_reserved(&name) {
                    return Err(self.unexpected("expression"));
                }
                Ok(Expression::Path(self.path()?))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn function_call(&mut self, name: &str, position: usize) -> Result<Expression, Error> {
        if let Some(function) = AggregateFunction::from_name(name) {
            self.advance();
            self.expect(&TokenKind::LeftParen)?;
            let distinct = self.accept_keyword("DISTINCT");
            let argument = self.expression()?;
            self.expect(&TokenKind::RightParen)?;
            return Ok(Expression::Aggregate {
                function,
                distinct,
                argument: Box::new(argument),
                position,
            });
        }
        let Some(function) = ScalarFunction::from_name(name) else {
            return Err(syntax_error(format!("unknown function '{name}'"), position, name));
        };
        self.advance();
        self.expect(&TokenKind::LeftParen)?;
        let mut arguments = vec![self.expression()?];
        while self.accept(&TokenKind::Comma) {
            arguments.push(self.expression()?);
        }
        self.expect(&TokenKind::RightParen)?;
        let (min, max) = function.arity();
        if arguments.len() < min || arguments.len() > max {
            return Err(syntax_error(
                format!(
                    "{} expects {} argument(s), got {}",
                    function.as_sql(),
                    if min == max { min.to_string() } else { format!("at least {min}") },
                    arguments.len()
                ),
                position,
                name,
            ));
        }
        Ok(Expression::Function {
            function,
            arguments,
            position,
        })
    }

    /// `alias` or `alias.field`.
    fn path(&mut self) -> Result<PathExpression, Error> {
        let (alias, position) = self.identifier("identification variable")?;
        let field = if self.accept(&TokenKind::Dot) {
            Some(self.identifier("field name")?.0)
        } else {
            None
        };
        Ok(PathExpression {
            alias,
            field,
            position,
        })
    }

    // ------------------------------------------------------------------
    // Semantic checks
    // ------------------------------------------------------------------

    /// Result variables are only visible in HAVING and ORDER BY.
    fn check_path(&self, path: &PathExpression, clause: Clause) -> Result<(), Error> {
        let Some(component) = self.components.get(&path.alias) else {
            if path.field.is_none() && self.components.is_result_variable(&path.alias) {
                if matches!(clause, Clause::Having | Clause::OrderBy) {
                    return Ok(());
                }
                return Err(syntax_error(
                    format!(
                        "result variable '{}' can only be used in HAVING or ORDER BY",
                        path.alias
                    ),
                    path.position,
                    path.to_string(),
                ));
            }
            return Err(syntax_error(
                format!("unknown alias '{}'", path.alias),
                path.position,
                path.to_string(),
            ));
        };
        let Some(field) = &path.field else {
            return Ok(());
        };
        let metadata = &component.metadata;
        if metadata.field(field).is_some() {
            return Ok(());
        }
        match metadata.association(field) {
            Some(assoc) if assoc.has_join_columns() && assoc.join_columns.len() <= 1 => Ok(()),
            Some(_) => Err(syntax_error(
                format!(
                    "association '{field}' of '{}' cannot be used as a value; join it instead",
                    metadata.name()
                ),
                path.position,
                path.to_string(),
            )),
            None => Err(syntax_error(
                format!("unknown field '{field}' on entity '{}'", metadata.name()),
                path.position,
                path.to_string(),
            )),
        }
    }

    fn check_assignment(&self, update: &UpdateStatement, assignment: &Assignment) -> Result<(), Error> {
        let path = &assignment.path;
        if path.alias != update.alias || path.field.is_none() {
            return Err(syntax_error(
                format!("UPDATE may only assign fields of '{}'", update.alias),
                path.position,
                path.to_string(),
            ));
        }
        self.check_path(path, Clause::Set)
    }
}

/// Every expression of `statement` with the clause it appears in, in textual order.
fn statement_expressions(statement: &Statement) -> Vec<(Clause, &Expression)> {
    fn push_condition<'a>(
        clause: Clause,
        condition: Option<&'a Condition>,
        out: &mut Vec<(Clause, &'a Expression)>,
    ) {
        if let Some(condition) = condition {
            condition.for_each_expression(&mut |e| out.push((clause, e)));
        }
    }

    let mut expressions = Vec::new();
    match statement {
        Statement::Select(select) => {
            expressions.extend(select.items.iter().map(|item| (Clause::Select, &item.expression)));
            for declaration in &select.from {
                for join in &declaration.joins {
                    push_condition(Clause::From, join.condition.as_ref(), &mut expressions);
                }
            }
            push_condition(Clause::Where, select.where_clause.as_ref(), &mut expressions);
            expressions.extend(select.group_by.iter().map(|e| (Clause::GroupBy, e)));
            push_condition(Clause::Having, select.having.as_ref(), &mut expressions);
            expressions.extend(
                select
                    .order_by
                    .iter()
                    .map(|item| (Clause::OrderBy, &item.expression)),
            );
        }
        Statement::Update(update) => {
            expressions.extend(update.assignments.iter().map(|a| (Clause::Set, &a.value)));
            push_condition(Clause::Where, update.where_clause.as_ref(), &mut expressions);
        }
        Statement::Delete(delete) => {
            push_condition(Clause::Where, delete.where_clause.as_ref(), &mut expressions);
        }
    }
    expressions
}
