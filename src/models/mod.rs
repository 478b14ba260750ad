//! Data models for parlsync.

mod import;
mod resource;
mod run;

pub use import::{ImportState, ImportStatus, Lease};
pub use resource::{
    parse_http_date, CandidateResource, ChangeDecision, ChangeMethod, Classification, Detection,
    DiscoveryStatus, Fingerprint, ProbeOutcome, RemoteMetadata, ResourceRecord, UNCLASSIFIED,
};
pub use run::{PipelineRun, RunCounters, RunMode, RunPhase};
