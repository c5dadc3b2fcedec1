//! The batch jobs themselves. Each exposes `run(pool, ..., commit)` and
//! returns a summary the CLI prints; none of them writes unless
//! `commit` is true.

pub mod merge_contacts;
pub mod recompute_locks;
pub mod replay;
