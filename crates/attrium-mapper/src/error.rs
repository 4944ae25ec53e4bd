//! Error types for the mapper crate.
//!
//! Only loading surfaces errors. Evaluation failures and apply failures are
//! handled locally by the engine: an assignment that cannot run is simply
//! not applied, with a diagnostic on the log.

#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    /// An expression references a function that is not built in. The whole
    /// load unit is rejected.
    #[error("unknown function '{0}' in expression")]
    UnknownFunction(String),

    /// The right-hand side reads no attribute at all, so the assignment
    /// could never be re-evaluated.
    #[error("constant assignment: {0}")]
    ConstantAssignment(String),

    /// The final left-hand-side path element does not pin down exactly one
    /// attribute type.
    #[error("cannot derive a single assigned type for: {0}")]
    AmbiguousAssignedType(String),

    /// The assignment reads the very value it writes.
    #[error("assignment depends on its own destination: {0}")]
    SelfReferential(String),

    /// The mapping directory does not exist or is not a directory.
    #[error("mapping directory not found: {0}")]
    DirectoryNotFound(String),

    /// The external parser rejected a mapping source.
    #[error("failed to parse {unit}: {message}")]
    Parse { unit: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mapper operations.
pub type Result<T> = std::result::Result<T, MapperError>;
