//! Extraction pipeline: wire types, the per-file protocol, and the
//! reconciliation of raw items into canonical model records.

pub mod extract;
pub mod item;
pub mod reconcile;

pub use extract::{run_extraction, ExtractError, ExtractionOutcome, ExtractionOutcomeStatus};
pub use item::{EnumeratedModels, ExtractionArtifact, RawModelItem};
pub use reconcile::{project_item, reconcile_item, ProjectedModel};
