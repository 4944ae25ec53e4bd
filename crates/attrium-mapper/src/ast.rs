//! Abstract syntax tree for the attribute mapping language.
//!
//! A mapping source is a sequence of scopes; a scope carries settings shared
//! by its assignments. Each assignment computes a destination attribute from
//! an expression over other attributes:
//!
//! ```text
//! scope 10 {
//!     r'1102 = r'1101 + 1
//!     d'2205[0].3301 = d'2204 * 10
//!     c'1102 = e'1101
//!     i'3400[2] = r'1101 > 0
//! }
//! ```
//!
//! The parser producing this tree lives outside the core; see
//! [`crate::MapParser`]. Trees can also be built programmatically, which is
//! how the engine tests construct their rule sets.

use std::fmt;

use attrium_store::{AttributeTypeId, ValueState};
use serde::{Deserialize, Serialize};

/// Which value slot of an attribute an expression or assignment refers to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// `r'`: the reported value.
    Reported,
    /// `d'`: the desired value.
    Desired,
    /// `e'`: existence of the attribute itself.
    Existence,
}

impl ValueKind {
    /// Source-language sigil for this kind.
    pub fn symbol(self) -> char {
        match self {
            ValueKind::Reported => 'r',
            ValueKind::Desired => 'd',
            ValueKind::Existence => 'e',
        }
    }

    /// The store value state whose changes feed this kind. Existence rides on
    /// the reported side, where create/delete events are emitted.
    pub fn state(self) -> ValueState {
        match self {
            ValueKind::Desired => ValueState::Desired,
            ValueKind::Reported | ValueKind::Existence => ValueState::Reported,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'", self.symbol())
    }
}

/// Binary operators of the expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    Or,
    And,
}

impl BinaryOperator {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Equal => "==",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::LessThan => "<",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::Or => "|",
            BinaryOperator::And => "&",
        }
    }
}

/// One step of an attribute path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathElement {
    /// A plain type step: navigate to the first child of this type.
    Type(AttributeTypeId),
    /// A subscript step `t[i]`: navigate to the child of type `t` whose
    /// reported number equals `i`. Both parts are expressions evaluated
    /// against the navigation anchor.
    Subscript {
        attr_type: Box<Expr>,
        index: Box<Expr>,
    },
}

impl PathElement {
    /// The type id when this element is a literal type step or a subscript
    /// with a literal type expression.
    pub fn literal_type(&self) -> Option<AttributeTypeId> {
        match self {
            PathElement::Type(t) => Some(*t),
            PathElement::Subscript { attr_type, .. } => match attr_type.as_ref() {
                Expr::Literal(value) => Some(*value as AttributeTypeId),
                _ => None,
            },
        }
    }

    /// Whether this element is a subscript.
    pub fn is_subscript(&self) -> bool {
        matches!(self, PathElement::Subscript { .. })
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Type(t) => write!(f, "{t}"),
            PathElement::Subscript { attr_type, index } => {
                write!(f, "{attr_type}[{index}]")
            }
        }
    }
}

/// An expression of the mapping language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A numeric constant.
    Literal(f64),
    /// An attribute reference, navigated from the evaluation context node.
    Attribute {
        kind: ValueKind,
        path: Vec<PathElement>,
    },
    /// Arithmetic negation.
    Negate(Box<Expr>),
    /// A binary operation.
    Binary {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `if(condition, then, else)`.
    If {
        condition: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    /// A built-in function invocation.
    Call { function: String, arguments: Vec<Expr> },
}

impl Expr {
    /// Shorthand for an attribute reference with a plain type path.
    pub fn attribute(kind: ValueKind, types: &[AttributeTypeId]) -> Self {
        Expr::Attribute {
            kind,
            path: types.iter().copied().map(PathElement::Type).collect(),
        }
    }

    /// Shorthand for a binary operation.
    pub fn binary(op: BinaryOperator, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Attribute { kind, path } => {
                write!(f, "{kind}")?;
                for (i, element) in path.iter().enumerate() {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{element}")?;
                }
                Ok(())
            }
            Expr::Negate(inner) => write!(f, "-{inner}"),
            Expr::Binary { op, left, right } => {
                write!(f, "({left} {} {right})", op.symbol())
            }
            Expr::If {
                condition,
                then_value,
                else_value,
            } => write!(f, "if({condition}, {then_value}, {else_value})"),
            Expr::Call {
                function,
                arguments,
            } => {
                write!(f, "{function}(")?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{argument}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Left-hand side of an assignment: a value kind and an attribute path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributePath {
    pub kind: ValueKind,
    pub elements: Vec<PathElement>,
}

impl AttributePath {
    pub fn new(kind: ValueKind, elements: Vec<PathElement>) -> Self {
        Self { kind, elements }
    }

    /// Path made of plain type steps only.
    pub fn from_types(kind: ValueKind, types: &[AttributeTypeId]) -> Self {
        Self {
            kind,
            elements: types.iter().copied().map(PathElement::Type).collect(),
        }
    }

    /// Whether any element of the path is a subscript.
    pub fn has_subscript(&self) -> bool {
        self.elements.iter().any(PathElement::is_subscript)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{element}")?;
        }
        Ok(())
    }
}

/// The three assignment flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentKind {
    /// Writes the evaluated value into the destination.
    Regular,
    /// `c'`: undefines the destination value when the expression is truthy.
    Clearance,
    /// `i'`: ensures an instance node with a given value exists (or not).
    Instance,
}

/// A declarative rule computing a destination attribute from an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub kind: AssignmentKind,
    pub lhs: AttributePath,
    pub rhs: Expr,
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            AssignmentKind::Regular => "",
            AssignmentKind::Clearance => "c:",
            AssignmentKind::Instance => "i:",
        };
        write!(f, "{prefix}{} = {}", self.lhs, self.rhs)
    }
}

/// Settings shared by all assignments of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    /// Priority of the scope's assignments when several compete for the same
    /// destination. Higher wins.
    pub priority: i32,
    /// Overrides the engine-wide common parent type for this scope.
    pub common_parent_type: Option<AttributeTypeId>,
    /// When false, writes performed by this scope's assignments do not
    /// re-trigger evaluation.
    pub chain_reaction: bool,
    /// When true, a reported write first clears the destination's desired
    /// value.
    pub clear_desired: bool,
    /// When true, regular assignments create their destination if missing
    /// regardless of value kind.
    pub create_attributes: bool,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            priority: 0,
            common_parent_type: None,
            chain_reaction: true,
            clear_desired: false,
            create_attributes: false,
        }
    }
}

impl ScopeSettings {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

/// A scope: settings plus the assignments they govern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub settings: ScopeSettings,
    pub assignments: Vec<Assignment>,
}

/// A parsed mapping source: a sequence of scopes.
pub type AstTree = Vec<Scope>;
