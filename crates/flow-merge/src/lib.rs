pub mod conflict;
pub mod driver;
pub mod merge;

pub use conflict::{parse_markers, resolve_content, resolve_file, Piece, Resolution};
pub use driver::{append_log, run_merge, MergeSummary};
pub use merge::{merge_entities, ConflictRecord, MergeOutcome};
