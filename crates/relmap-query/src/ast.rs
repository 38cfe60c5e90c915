//! Abstract syntax tree of the object query language.
//!
//! The tree is immutable once parsed. Nodes that can be the subject of an
//! error carry the byte offset where they start in the query text. Resolved
//! metadata lives in [`QueryComponents`](crate::QueryComponents), not here.

use std::fmt;

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
        }
    }

    pub fn as_select(&self) -> Option<&SelectStatement> {
        match self {
            Statement::Select(select) => Some(select),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: Vec<RangeDeclaration>,
    pub where_clause: Option<Condition>,
    pub group_by: Vec<Expression>,
    pub having: Option<Condition>,
    pub order_by: Vec<OrderByItem>,
}

/// One expression of the SELECT list, with its optional result alias.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expression: Expression,
    pub alias: Option<String>,
    pub position: usize,
}

/// `Entity alias` in a FROM clause, with the joins hanging off it.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeDeclaration {
    pub entity: String,
    pub alias: String,
    pub joins: Vec<Join>,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub const fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
        }
    }
}

/// `JOIN alias.association joined [WITH condition]`
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub fetch: bool,
    pub path: PathExpression,
    pub alias: String,
    pub condition: Option<Condition>,
    pub position: usize,
}

/// `alias` or `alias.field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpression {
    pub alias: String,
    pub field: Option<String>,
    pub position: usize,
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}", self.alias, field),
            None => f.write_str(&self.alias),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expression: Expression,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub entity: String,
    pub alias: String,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<Condition>,
    pub position: usize,
}

/// `alias.field = value` in an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub path: PathExpression,
    pub value: Expression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub entity: String,
    pub alias: String,
    pub where_clause: Option<Condition>,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Vec<Condition>),
    And(Vec<Condition>),
    Not(Box<Condition>),
    Comparison {
        left: Expression,
        op: ComparisonOp,
        right: Expression,
    },
    Between {
        expression: Expression,
        low: Expression,
        high: Expression,
        negated: bool,
    },
    In {
        expression: Expression,
        list: Vec<Expression>,
        negated: bool,
    },
    Like {
        expression: Expression,
        pattern: Expression,
        negated: bool,
    },
    IsNull {
        expression: Expression,
        negated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl ComparisonOp {
    pub const fn as_sql(self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Path(PathExpression),
    Literal { value: Literal, position: usize },
    Parameter { parameter: ParameterRef, position: usize },
    Binary {
        op: ArithmeticOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Negate(Box<Expression>),
    Aggregate {
        function: AggregateFunction,
        distinct: bool,
        argument: Box<Expression>,
        position: usize,
    },
    Function {
        function: ScalarFunction,
        arguments: Vec<Expression>,
        position: usize,
    },
}

impl Expression {
    /// Visit every path expression in this expression tree.
    pub fn for_each_path<'a>(&'a self, f: &mut dyn FnMut(&'a PathExpression)) {
        match self {
            Expression::Path(path) => f(path),
            Expression::Literal { .. } | Expression::Parameter { .. } => {}
            Expression::Binary { left, right, .. } => {
                left.for_each_path(f);
                right.for_each_path(f);
            }
            Expression::Negate(inner) => inner.for_each_path(f),
            Expression::Aggregate { argument, .. } => argument.for_each_path(f),
            Expression::Function { arguments, .. } => {
                for argument in arguments {
                    argument.for_each_path(f);
                }
            }
        }
    }

    /// Visit every parameter reference, in textual order.
    pub fn for_each_parameter<'a>(&'a self, f: &mut dyn FnMut(&'a ParameterRef)) {
        match self {
            Expression::Parameter { parameter, .. } => f(parameter),
            Expression::Path(_) | Expression::Literal { .. } => {}
            Expression::Binary { left, right, .. } => {
                left.for_each_parameter(f);
                right.for_each_parameter(f);
            }
            Expression::Negate(inner) => inner.for_each_parameter(f),
            Expression::Aggregate { argument, .. } => argument.for_each_parameter(f),
            Expression::Function { arguments, .. } => {
                for argument in arguments {
                    argument.for_each_parameter(f);
                }
            }
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expression::Aggregate { .. } => true,
            Expression::Path(_) | Expression::Literal { .. } | Expression::Parameter { .. } => false,
            Expression::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Expression::Negate(inner) => inner.contains_aggregate(),
            Expression::Function { arguments, .. } => {
                arguments.iter().any(Expression::contains_aggregate)
            }
        }
    }
}

impl Condition {
    /// Expressions directly compared by this condition and its children.
    pub fn for_each_expression<'a>(&'a self, f: &mut dyn FnMut(&'a Expression)) {
        match self {
            Condition::Or(parts) | Condition::And(parts) => {
                for part in parts {
                    part.for_each_expression(f);
                }
            }
            Condition::Not(inner) => inner.for_each_expression(f),
            Condition::Comparison { left, right, .. } => {
                f(left);
                f(right);
            }
            Condition::Between {
                expression,
                low,
                high,
                ..
            } => {
                f(expression);
                f(low);
                f(high);
            }
            Condition::In {
                expression, list, ..
            } => {
                f(expression);
                for item in list {
                    f(item);
                }
            }
            Condition::Like {
                expression,
                pattern,
                ..
            } => {
                f(expression);
                f(pattern);
            }
            Condition::IsNull { expression, .. } => f(expression),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

/// A parameter placeholder in the query text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterRef {
    Named(String),
    Positional(usize),
}

impl fmt::Display for ParameterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterRef::Named(name) => write!(f, ":{name}"),
            ParameterRef::Positional(index) => write!(f, "?{index}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    pub const fn as_sql(self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Sub => "-",
            ArithmeticOp::Mul => "*",
            ArithmeticOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(Self::Count),
            "SUM" => Some(Self::Sum),
            "AVG" => Some(Self::Avg),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            _ => None,
        }
    }

    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunction {
    Lower,
    Upper,
    Length,
    Abs,
    Concat,
}

impl ScalarFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "LOWER" => Some(Self::Lower),
            "UPPER" => Some(Self::Upper),
            "LENGTH" => Some(Self::Length),
            "ABS" => Some(Self::Abs),
            "CONCAT" => Some(Self::Concat),
            _ => None,
        }
    }

    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Lower => "LOWER",
            Self::Upper => "UPPER",
            Self::Length => "LENGTH",
            Self::Abs => "ABS",
            Self::Concat => "CONCAT",
        }
    }

    /// Accepted argument count as `(min, max)`.
    pub const fn arity(self) -> (usize, usize) {
        match self {
            Self::Concat => (2, usize::MAX),
            _ => (1, 1),
        }
    }
}
