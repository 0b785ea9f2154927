//! Phase-based task engine for a coding agent.
//!
//! A task (repository, description, acceptance criteria) is carried through
//! a fixed sequence of phases: create a branch, implement, validate (with
//! bounded fix attempts), and open a pull request. Each phase declares the
//! context it needs and fails at construction if that context is missing or
//! malformed. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure logic (context, contracts, result parsing, verdicts).
//!   No I/O.
//! - **[`io`]**: Collaborators and side effects (agent client, tools, git,
//!   prompts, config). Traits at these seams allow scripted doubles in tests.
//!
//! [`phase`], [`workflow`] and [`task_machine`] put the two together.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod phase;
pub mod task_machine;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
