//! Node handlers: the per-kind behavior behind a fire.
//!
//! Each handler claims its node (`Pending -> Running`) through the store
//! before doing anything else, so speculative or concurrent fires resolve
//! to exactly one execution. All of them operate only on durable state —
//! nothing here keeps counters or progress in memory.

mod collector;
mod splitter;
mod ux_gate;
mod worker;
