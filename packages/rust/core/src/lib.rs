//! Core chat pipeline for Parley.
//!
//! This crate ties together the per-user stores, the answer generator, and
//! the markup renderer into the submit/subscribe streaming protocol and the
//! immediate (non-streaming) exchange.

pub mod assembler;
pub mod channel;
pub mod generator;
pub mod service;
pub mod worker;
pub mod xai;

pub use assembler::{DONE_MARKER, Frame, StreamAssembler, StreamOutcome, StreamState};
pub use channel::{Fragment, FragmentReceiver, FragmentSender, fragment_channel};
pub use generator::{EchoGenerator, FragmentCoalescer, GenerationRequest, Generator, build_generator};
pub use service::{ChatService, Exchange, StreamHandle, Subscription};
pub use worker::{GenerationWorker, WorkerOutcome};
pub use xai::XaiGenerator;
