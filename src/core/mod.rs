pub mod cache;
pub mod engine;
pub mod gate;
pub mod hasher;
pub mod ledger;
pub mod persist;
pub mod reporting;
pub mod state;
pub mod timing;

pub use cache::{CacheEntry, CacheKey, ChecksumCache};
pub use engine::{CopyVerifyEngine, EngineConfig, ExecuteRequest};
pub use gate::{AsyncGate, GatePermit};
pub use hasher::{compare_bytes, digest_file, FileHasher, HasherStats};
pub use ledger::ResultsLedger;
pub use reporting::{
    ErrorCategory, ErrorContext, ErrorReport, ErrorReportingService, ErrorSeverity, ErrorSummary,
    OperationOutcome, RecoveryAction,
};
pub use state::{
    can_auto_resume, ChannelLifecycleSignal, LifecycleEvent, LifecycleSignal, OperationState,
    OperationStateService, PauseReason, ResumePolicy, SavedOperationState,
};
pub use timing::{TimingSnapshot, TimingTracker};
