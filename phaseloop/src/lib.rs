//! Phase-driven development loop.
//!
//! A session works through a checklist plan one task at a time. Each task goes
//! through four phases (Study, Implement, Test, Update) driven by a single
//! worker thread; callers pause, step, resume or stop it through a
//! [`engine::LoopHandle`]. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (session state machine, cycle
//!   budget, invariants, code-block parsing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, HTTP generation, child
//!   processes). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`engine`], [`phases`], [`launch`]) coordinate core
//! logic with I/O.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod launch;
pub mod logging;
pub mod phases;
pub mod plan;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
