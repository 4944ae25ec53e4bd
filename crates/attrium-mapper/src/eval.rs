//! Expression and path evaluation.
//!
//! Three walks over the same AST:
//!
//! - [`Evaluator`] computes the numeric value of an expression against a
//!   context node. A missing dependency makes the whole expression evaluate
//!   to `None`; this is the ordinary "not applicable yet" outcome, not an
//!   error.
//! - [`collect_dependencies`] extracts the `(type, kind)` pairs an expression
//!   reads, which is what the dependency index is built from.
//! - [`walk_path`] / [`path_matches_destination`] navigate left-hand-side
//!   paths through the store, non-creating; the engine layers its
//!   create-if-missing policy on top of the walk result.

use std::collections::BTreeSet;

use attrium_store::{AttributeId, AttributeStore, AttributeTypeId};

use crate::ast::{BinaryOperator, Expr, PathElement, ValueKind};

/// A dependency of an expression: it reads this kind of this attribute type.
pub type AttributeDependency = (AttributeTypeId, ValueKind);

type BuiltInFunction = fn(&[f64]) -> Option<f64>;

fn min_value(args: &[f64]) -> Option<f64> {
    args.iter().copied().reduce(f64::min)
}

fn max_value(args: &[f64]) -> Option<f64> {
    args.iter().copied().reduce(f64::max)
}

fn average_value(args: &[f64]) -> Option<f64> {
    if args.is_empty() {
        return None;
    }
    Some(args.iter().sum::<f64>() / args.len() as f64)
}

fn absolute_value(args: &[f64]) -> Option<f64> {
    args.first().map(|value| value.abs())
}

/// Look up a built-in function by name.
pub fn built_in_function(name: &str) -> Option<BuiltInFunction> {
    match name {
        "min_value" => Some(min_value),
        "max_value" => Some(max_value),
        "average_value" => Some(average_value),
        "absolute_value" => Some(absolute_value),
        _ => None,
    }
}

/// First unknown function name in an expression, if any.
pub fn find_unknown_function(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Literal(_) => None,
        Expr::Attribute { path, .. } => path.iter().find_map(find_unknown_function_in_element),
        Expr::Negate(inner) => find_unknown_function(inner),
        Expr::Binary { left, right, .. } => {
            find_unknown_function(left).or_else(|| find_unknown_function(right))
        }
        Expr::If {
            condition,
            then_value,
            else_value,
        } => find_unknown_function(condition)
            .or_else(|| find_unknown_function(then_value))
            .or_else(|| find_unknown_function(else_value)),
        Expr::Call {
            function,
            arguments,
        } => {
            if built_in_function(function).is_none() {
                return Some(function);
            }
            arguments.iter().find_map(find_unknown_function)
        }
    }
}

/// First unknown function name inside a path element's subscript expressions.
pub fn find_unknown_function_in_element(element: &PathElement) -> Option<&str> {
    match element {
        PathElement::Type(_) => None,
        PathElement::Subscript { attr_type, index } => {
            find_unknown_function(attr_type).or_else(|| find_unknown_function(index))
        }
    }
}

fn truthy(value: f64) -> bool {
    value != 0.0
}

fn bool_value(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Evaluates expressions against a context node.
pub struct Evaluator<'a> {
    store: &'a AttributeStore,
    context: AttributeId,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a AttributeStore, context: AttributeId) -> Self {
        Self { store, context }
    }

    /// Evaluate an expression. `None` means a dependency could not be
    /// resolved (missing node, undefined value, non-numeric payload) or the
    /// arithmetic was undefined (division by zero).
    pub fn evaluate(&self, expr: &Expr) -> Option<f64> {
        match expr {
            Expr::Literal(value) => Some(*value),
            Expr::Attribute { kind, path } => self.evaluate_attribute(*kind, path),
            Expr::Negate(inner) => self.evaluate(inner).map(|value| -value),
            Expr::Binary { op, left, right } => {
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                self.apply_operator(*op, left, right)
            }
            Expr::If {
                condition,
                then_value,
                else_value,
            } => {
                if truthy(self.evaluate(condition)?) {
                    self.evaluate(then_value)
                } else {
                    self.evaluate(else_value)
                }
            }
            Expr::Call {
                function,
                arguments,
            } => {
                let function = built_in_function(function)?;
                let arguments = arguments
                    .iter()
                    .map(|argument| self.evaluate(argument))
                    .collect::<Option<Vec<_>>>()?;
                function(&arguments)
            }
        }
    }

    fn apply_operator(&self, op: BinaryOperator, left: f64, right: f64) -> Option<f64> {
        match op {
            BinaryOperator::Add => Some(left + right),
            BinaryOperator::Subtract => Some(left - right),
            BinaryOperator::Multiply => Some(left * right),
            BinaryOperator::Divide => {
                if right == 0.0 {
                    None
                } else {
                    Some(left / right)
                }
            }
            BinaryOperator::Modulo => {
                if right == 0.0 {
                    None
                } else {
                    Some(left % right)
                }
            }
            BinaryOperator::Equal => Some(bool_value(left == right)),
            BinaryOperator::NotEqual => Some(bool_value(left != right)),
            BinaryOperator::LessThan => Some(bool_value(left < right)),
            BinaryOperator::GreaterThan => Some(bool_value(left > right)),
            BinaryOperator::Or => Some(bool_value(truthy(left) || truthy(right))),
            BinaryOperator::And => Some(bool_value(truthy(left) && truthy(right))),
        }
    }

    fn evaluate_attribute(&self, kind: ValueKind, path: &[PathElement]) -> Option<f64> {
        let resolution = walk_path(self.store, self.context, path);
        match kind {
            ValueKind::Existence => Some(bool_value(
                resolution.all_parsed()
                    && resolution
                        .node
                        .map(|node| self.store.node_exists(node))
                        .unwrap_or(false),
            )),
            ValueKind::Reported => {
                let node = resolution.target()?;
                self.store.get_reported_number(node)
            }
            ValueKind::Desired => {
                let node = resolution.target()?;
                self.store.get_desired_number(node)
            }
        }
    }
}

/// Collect the `(type, kind)` pairs an expression reads.
///
/// For an attribute reference, the final path element contributes the
/// reference's own kind; ancestor elements contribute existence, since the
/// reference breaks when any of them disappears. Subscript expressions
/// contribute their own dependencies recursively.
pub fn collect_dependencies(expr: &Expr) -> BTreeSet<AttributeDependency> {
    let mut dependencies = BTreeSet::new();
    collect_into(expr, &mut dependencies);
    dependencies
}

fn collect_into(expr: &Expr, out: &mut BTreeSet<AttributeDependency>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Attribute { kind, path } => {
            let last = path.len().saturating_sub(1);
            for (i, element) in path.iter().enumerate() {
                let element_kind = if i == last { *kind } else { ValueKind::Existence };
                out.extend(path_dependencies(element_kind, element));
            }
        }
        Expr::Negate(inner) => collect_into(inner, out),
        Expr::Binary { left, right, .. } => {
            collect_into(left, out);
            collect_into(right, out);
        }
        Expr::If {
            condition,
            then_value,
            else_value,
        } => {
            collect_into(condition, out);
            collect_into(then_value, out);
            collect_into(else_value, out);
        }
        Expr::Call { arguments, .. } => {
            for argument in arguments {
                collect_into(argument, out);
            }
        }
    }
}

/// Dependencies of a single path element read with the given kind.
///
/// A literal element yields exactly one pair; a subscript with a computed
/// type expression yields the dependencies of that expression instead, which
/// is how the engine detects that it cannot derive a unique assigned type.
pub fn path_dependencies(kind: ValueKind, element: &PathElement) -> Vec<AttributeDependency> {
    match element {
        PathElement::Type(t) => vec![(*t, kind)],
        PathElement::Subscript { attr_type, index } => {
            let mut dependencies = Vec::new();
            match attr_type.as_ref() {
                Expr::Literal(value) => {
                    dependencies.push((*value as AttributeTypeId, kind));
                }
                other => dependencies.extend(collect_dependencies(other)),
            }
            dependencies.extend(collect_dependencies(index));
            dependencies
        }
    }
}

/// Outcome of a non-creating path navigation.
#[derive(Debug, Clone, Copy)]
pub struct PathResolution {
    /// Deepest node reached. When the final element failed, this is the node
    /// the missing attribute would be created under.
    pub node: Option<AttributeId>,
    /// Number of elements successfully navigated.
    pub elements_parsed: usize,
    /// Total number of elements in the path.
    pub path_len: usize,
    /// Type of the first element that failed to resolve, when known.
    pub failed_type: Option<AttributeTypeId>,
}

impl PathResolution {
    /// Whether the whole path resolved.
    pub fn all_parsed(&self) -> bool {
        self.elements_parsed == self.path_len
    }

    /// Whether everything but the final element resolved.
    pub fn only_last_missing(&self) -> bool {
        self.path_len > 0 && self.elements_parsed == self.path_len - 1
    }

    /// The fully resolved node, when the whole path parsed.
    pub fn target(&self) -> Option<AttributeId> {
        if self.all_parsed() {
            self.node
        } else {
            None
        }
    }
}

/// Navigate a path from `anchor`, never creating nodes. Subscript
/// expressions are evaluated against `anchor` and matched against the
/// reported number of candidate children.
pub fn walk_path(
    store: &AttributeStore,
    anchor: AttributeId,
    path: &[PathElement],
) -> PathResolution {
    let evaluator = Evaluator::new(store, anchor);
    let mut current = anchor;
    let mut parsed = 0;

    for element in path {
        let next = match element {
            PathElement::Type(t) => store.child_by_type(current, *t, 0),
            PathElement::Subscript { attr_type, index } => {
                let attr_type = evaluator.evaluate(attr_type);
                let index = evaluator.evaluate(index);
                match (attr_type, index) {
                    (Some(attr_type), Some(index)) => store
                        .children_of_type(current, attr_type as AttributeTypeId)
                        .into_iter()
                        .find(|child| store.get_reported_number(*child) == Some(index)),
                    _ => None,
                }
            }
        };
        match next {
            Some(node) => {
                current = node;
                parsed += 1;
            }
            None => {
                let failed_type = match element {
                    PathElement::Type(t) => Some(*t),
                    PathElement::Subscript { attr_type, .. } => evaluator
                        .evaluate(attr_type)
                        .map(|value| value as AttributeTypeId),
                };
                return PathResolution {
                    node: Some(current),
                    elements_parsed: parsed,
                    path_len: path.len(),
                    failed_type,
                };
            }
        }
    }

    PathResolution {
        node: Some(current),
        elements_parsed: parsed,
        path_len: path.len(),
        failed_type: None,
    }
}

/// Check that a candidate destination structurally matches a path by walking
/// the tree backward from the destination: the destination's type must match
/// the final element, each ancestor the preceding element, and the node above
/// the first element must be of the common parent type.
pub fn path_matches_destination(
    store: &AttributeStore,
    destination: AttributeId,
    path: &[PathElement],
    common_parent_type: AttributeTypeId,
) -> bool {
    let mut current = destination;
    for element in path.iter().rev() {
        let node_type = match store.node_type(current) {
            Some(t) => t,
            None => return false,
        };
        // Computed subscript types cannot be compared without a context;
        // accept them structurally.
        if let Some(expected) = element.literal_type() {
            if node_type != expected {
                return false;
            }
        }
        match store.parent(current) {
            Some(parent) => current = parent,
            None => return false,
        }
    }
    store.node_type(current) == Some(common_parent_type)
}
