// Record Merge Engine - Core Library
// Exposes all modules for use in the demo binary and tests

pub mod audit;
pub mod config;
pub mod directive;
pub mod entity;
pub mod error;
pub mod merge;
pub mod relations;
pub mod snapshot;
pub mod store;
pub mod strategy;

// Re-export commonly used types
pub use audit::{insert_merge_log, merge_history_for, setup_merge_log, MergeLogEntry};
pub use config::{deep_merge, MergeOverrides};
pub use directive::{normalize, RelationAction, RelationDirective};
pub use entity::{
    EntityRegistry, EntitySchema, Mergeable, Record, RelationDescriptor, RelationKind,
    SchemaEntity,
};
pub use error::{MergeError, Result};
pub use merge::{FailureSignal, MergeEngine, MergeOptions, MergeResult, RecordRef};
pub use relations::{
    RelationContext, RelationExecutor, RelationOutcome, REASON_TARGET_HAS_RELATION,
    REASON_UNIQUENESS_CONFLICT,
};
pub use snapshot::capture;
pub use store::{load_record, setup_database};
pub use strategy::{
    resolve_field, CallbackRegistry, FieldResolution, MergeStrategy, Resolved, ResolveContext,
    Role,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
