//! Session-log core for an agent dashboard: parse append-only JSONL session logs, segment them
//! into turns, derive a live status, and rewind or re-attach conversation suffixes without
//! losing bytes.

pub mod app;
pub mod cli;
pub mod domain;
pub mod infra;
