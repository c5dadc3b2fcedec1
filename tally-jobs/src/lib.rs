//! tally-jobs - offline batch reconciliation
//!
//! The same resolution/merge core as the live webhook path, run against
//! the full contact set. Every job is dry-run by default and prints its
//! full mutation plan; `--commit` is required to write, destructive
//! merges snapshot the removed record first, and each merge runs inside
//! a store transaction.

pub mod jobs;

