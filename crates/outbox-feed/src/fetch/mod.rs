//! Plan execution against relays.
//!
//! - [`FetchOrchestrator`] - wave-based and streaming fan-out with timeouts,
//!   deduplication and early termination
//! - [`Generations`] - generation tickets that cancel superseded requests
//! - [`FetchOutcome`] / [`StreamChunk`] / [`StreamSummary`] - results

mod generation;
mod orchestrator;
mod outcome;

pub use generation::{GenerationTicket, Generations};
pub use orchestrator::{FetchOptions, FetchOrchestrator};
pub use outcome::{FetchOutcome, FetchTiming, StopReason, StreamChunk, StreamSummary};
