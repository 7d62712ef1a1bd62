// Officer Linkage - Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod table;
pub mod identity;   // Intra-file identity assignment
pub mod profile;    // Profile aggregation
pub mod keys;       // Derived comparison keys
pub mod reference;  // Reference table + UID invariants
pub mod merge;      // Cross-source merge engine
pub mod store;      // Versioned reference store
pub mod ledger;     // SQLite audit ledger
pub mod intervals;  // Unit interval resolution
pub mod config;
pub mod pipeline;

// Re-export commonly used types
pub use error::{LinkageError, Result};
pub use table::{Cell, FileFormat, RowRef, Table};
pub use identity::{ConflictPolicy, IdentityAssigner, IdentityAssignment, IdentityConfig};
pub use profile::{AggregationSpec, CurrentSpec, LookupSpec, ProfileAggregator};
pub use keys::{derive_keys, KeySpec, KeyTransform, NicknameDictionary};
pub use reference::{ReferenceTable, UID_COLUMN};
pub use merge::{
    remerge, AmbiguousMatch, Cutoff, KeyPair, MatchRecord, MatchedIdentity, MergeEngine,
    MergeOutcome, MergeReport, MergeRule, PairFilter, SourcePlan, Whitelist,
};
pub use store::{Manifest, ReferenceStore};
pub use ledger::{AmbiguityRecord, Event, Ledger};
pub use intervals::{
    IntervalBatch, IntervalColumns, IntervalResolver, RawInterval, ResolutionReport, ResolvedSpan,
};
pub use config::PipelineConfig;
pub use pipeline::{Pipeline, PreparedSource};
