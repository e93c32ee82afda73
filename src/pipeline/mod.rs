//! Order intake pipeline.
//!
//! Every located message flows through:
//! 1. `decode_message()` — MIME walk to subject, date, body and attachment
//! 2. `CandidateAssembler::assemble()` — document extraction + field rules
//! 3. `Resolver::resolve()` + `DuplicateDetector::check()` — reconciliation
//! 4. `PreviewBuilder::build()` — the reviewable report
//!
//! **Nothing is persisted during preview.** Orders are written only by
//! `CommitOrchestrator`, for candidates a reviewer approved.

pub mod cache;
pub mod candidate;
pub mod commit;
pub mod duplicates;
pub mod preview;
pub mod reconcile;
pub mod rules;
pub mod service;
pub mod types;
