//! Error taxonomy for the migration core.
//!
//! Only [`MappingError`] aborts a run: it means the configuration itself is
//! broken. Conversion, validation and persistence failures are row-local and
//! are folded into a [`RowError`] by the migration controller, which diverts
//! the offending row to the rejects sink and moves on.

use thiserror::Error;

/// Schema defect detected while compiling a mapping or default rule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("Invalid attribute path '{path}' for column '{column}': {reason}")]
    InvalidPath {
        column: String,
        path: String,
        reason: String,
    },

    #[error("Invalid mapping: {0}")]
    Invalid(String),

    #[error("Column '{0}' is not present in the input headers")]
    UnknownColumn(String),

    #[error("Columns '{first}' and '{second}' both map to '{path}'")]
    DuplicatePath {
        first: String,
        second: String,
        path: String,
    },

    #[error("Unknown conversion hook '{hook}' for column '{column}'")]
    UnknownHook { column: String, hook: String },

    #[error("Unknown class '{0}'")]
    UnknownClass(String),

    #[error("Invalid default for {class}.{attribute}: {reason}")]
    InvalidDefault {
        class: String,
        attribute: String,
        reason: String,
    },

    #[error("Invalid uniqueness key {class}.{attribute}: {reason}")]
    InvalidUniqueKey {
        class: String,
        attribute: String,
        reason: String,
    },
}

/// A field value that could not be converted to its target type.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Column '{column}': cannot convert '{value}' to {target}: {reason}")]
pub struct ConversionError {
    pub column: String,
    pub value: String,
    pub target: String,
    pub reason: String,
}

/// Row-local inconsistency in the object graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Conflicting values for {class}.{attribute}: '{existing}' versus '{incoming}'")]
    Conflict {
        class: String,
        attribute: String,
        existing: String,
        incoming: String,
    },

    #[error("Cannot add {child} to {owner} since it already contains {existing}")]
    OwnerConflict {
        owner: String,
        child: String,
        existing: String,
    },

    #[error("{child} is already owned by {existing}; cannot add it to {owner}")]
    AlreadyOwned {
        owner: String,
        child: String,
        existing: String,
    },

    #[error("Cannot decide the owner of {class}: candidates {candidates}")]
    AmbiguousOwner { class: String, candidates: String },

    #[error("Unknown class '{0}'")]
    UnknownClass(String),

    #[error("{class} has no attribute '{attribute}'")]
    UnknownAttribute { class: String, attribute: String },

    #[error("{class}.{attribute} is mandatory but has no value")]
    MissingMandatory { class: String, attribute: String },

    #[error("Cyclic containment: {0}")]
    Cycle(String),

    #[error("{class}: {message}")]
    Hook { class: String, message: String },
}

/// The persistence gateway rejected an object, or the graph could not be ordered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("Failed to {action} {class}: {message}")]
    Rejected {
        action: String,
        class: String,
        message: String,
    },

    #[error("Found {count} existing {class} object(s) matching {key}")]
    AmbiguousMatch {
        class: String,
        key: String,
        count: usize,
    },

    #[error("Cannot order {0} object(s) for persistence: dependency cycle")]
    Unordered(usize),
}

/// Any failure that diverts a single row to the rejects sink.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Malformed record: {0}")]
    Malformed(String),
}

impl RowError {
    pub fn kind(&self) -> &'static str {
        match self {
            RowError::Conversion(_) => "conversion",
            RowError::Validation(_) => "validation",
            RowError::Persistence(_) => "persistence",
            RowError::Malformed(_) => "malformed",
        }
    }
}

/// Run-level failure. Everything here stops the migration.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("Reading input: {0}")]
    Source(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = MigrationError> = std::result::Result<T, E>;
