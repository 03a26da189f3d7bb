//! Real-time log ingestion: demultiplexes the shared stream of tagged
//! game-server log lines to reservations and executes the in-game chat
//! command grammar.

pub mod parse;
pub mod pipeline;

pub use parse::{ChatCommand, ChatLine};
pub use pipeline::{LogBatch, LogPipeline};
