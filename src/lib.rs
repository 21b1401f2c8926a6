//! condense — the context-budget and compaction pipeline of an AI
//! coding-agent platform.
//!
//! Keeps a long-running conversation (and the noisy shell output it
//! produces) within a model's context window without losing information the
//! user or agent still needs:
//!
//! - [`compaction`] — summarize history, atomically replace it, and survive
//!   crashes mid-compaction via a persisted pending-state document.
//! - [`session`] — reinject preserved context on the next turn, with a
//!   one-shot retry when the reinjection itself blows the context budget.
//! - [`mentions`] — expand `@file` references into budgeted, deduplicated,
//!   position-anchored content blocks.
//! - [`bash`] — decide whether a command's output needs compaction, and
//!   which lines to keep when it does.
//!
//! History storage, partial-stream checkpointing, model transport, file
//! access and event fan-out are external collaborators consumed through the
//! contracts in [`stores`].

pub mod bash;
pub mod compaction;
pub mod errors;
pub mod mentions;
pub mod message;
pub mod session;
pub mod stores;
pub mod util;
