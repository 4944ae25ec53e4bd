//! Attribute mapping engine for the Attrium core.
//!
//! This crate keeps a hierarchical attribute graph consistent with a set of
//! declarative mapping rules: assignments whose right-hand side is an
//! expression over other attributes. When an attribute changes, every
//! assignment depending on it is re-evaluated and its destination updated,
//! with priority arbitration between competing assignments and explicit
//! control over chain reactions.
//!
//! ## Example
//!
//! ```rust
//! use attrium_mapper::{MapperEngine, MapperRuntime};
//! use attrium_mapper::ast::{
//!     Assignment, AssignmentKind, AttributePath, BinaryOperator, Expr, Scope, ScopeSettings,
//!     ValueKind,
//! };
//! use attrium_store::AttributeStore;
//!
//! const ROOT: u32 = 1;
//! const ENDPOINT: u32 = 2;
//! const A: u32 = 100;
//! const B: u32 = 101;
//!
//! // r'B = r'A + 1, evaluated under endpoint nodes.
//! let scope = Scope {
//!     settings: ScopeSettings::default(),
//!     assignments: vec![Assignment {
//!         kind: AssignmentKind::Regular,
//!         lhs: AttributePath::from_types(ValueKind::Reported, &[B]),
//!         rhs: Expr::binary(
//!             BinaryOperator::Add,
//!             Expr::attribute(ValueKind::Reported, &[A]),
//!             Expr::Literal(1.0),
//!         ),
//!     }],
//! };
//!
//! let mut engine = MapperEngine::new(ENDPOINT);
//! engine.load_ast(&vec![scope]).unwrap();
//! let mut runtime = MapperRuntime::new(engine);
//!
//! let mut store = AttributeStore::new(ROOT);
//! let endpoint = store.add_node(ENDPOINT, store.root()).unwrap();
//! let a = store.add_node(A, endpoint).unwrap();
//! store.set_reported_number(a, 5.0).unwrap();
//! runtime.run_to_completion(&mut store);
//!
//! let b = store.child_by_type(endpoint, B, 0).unwrap();
//! assert_eq!(store.get_reported_number(b), Some(6.0));
//! ```

pub mod ast;
pub mod engine;
pub mod error;
pub mod eval;
pub mod process;

pub use engine::{AssignmentId, AssignmentProperties, MapParser, MapperEngine};
pub use error::{MapperError, Result};
pub use eval::{
    collect_dependencies, path_matches_destination, walk_path, AttributeDependency, Evaluator,
    PathResolution,
};
pub use process::{MapperRuntime, PropagationControl};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
