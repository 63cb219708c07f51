//! A bytecode virtual machine and cooperative scheduler for Scratch-style block programs.
//!
//! Programs consist of independent scripts attached to targets (a stage plus any number of
//! sprites and their clones). A loader populates an [`Engine`](engine::Engine) with targets and
//! broadcasts, an opaque compiler (see [`bytecode::ScriptCompiler`]) lowers every top-level block
//! to a compact word-stream bytecode, and the engine then steps the resulting script threads
//! cooperatively under a frame-time budget.
//!
//! The crate is split along the runtime's natural seams:
//!
//! - [`runtime`] — dynamically-typed [`Value`](runtime::Value)s, lists, and the injectable
//!   clock/RNG services.
//! - [`entity`] — the per-target block arena, broadcasts, and one-shot ID resolution.
//! - [`target`] — the stage/sprite model, costumes, sounds, and clone lineage.
//! - [`bytecode`] — the opcode set, the compiled [`Script`](bytecode::Script) artifact, and the
//!   compiler contract.
//! - [`process`] — the register-machine interpreter executing one script invocation.
//! - [`engine`] — thread scheduling, hat dispatch, clone and layer management, and the
//!   frame-paced event loop.
//!
//! Execution is strictly single-threaded and cooperative: scripts yield only at loop
//! boundaries (when not in atomic mode), after a primitive stops the script, or when they
//! finish. Host integrations drive the engine either through [`Engine::run`](engine::Engine::run)
//! or by calling [`Engine::step`](engine::Engine::step) from their own loop.

#[macro_use]
extern crate num_derive;

pub mod runtime;
pub mod entity;
pub mod target;
pub mod bytecode;
pub mod process;
pub mod engine;

#[cfg(test)]
mod test;
