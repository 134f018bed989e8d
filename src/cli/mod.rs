//! Interactive REPL mode: a thin HTTP client of the facade's own server
//! (spec.md §6 "CLI surface"), carried from the teacher's `cli/repl.rs` as a
//! client rather than a UNIX-socket hub session.

pub mod repl;
