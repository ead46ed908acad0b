//! Worker bridge daemon.
//!
//! `bridged` connects one autonomous worker to a team lead through
//! nothing but files: it polls a task directory for claimable work,
//! drives a code-generation CLI (`codex` or `gemini`) as a subprocess,
//! and reports progress over append-only JSONL channels. No sockets,
//! no IPC, no shared memory.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod prompt;
