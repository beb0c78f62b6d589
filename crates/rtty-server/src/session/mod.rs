//! PTY session: process supervision and the sequenced output log.

pub mod output_log;
pub mod pty;
pub mod supervisor;

pub use output_log::{OutputLog, OutputRecord};
pub use pty::SpawnSpec;
pub use supervisor::{PtySupervisor, TerminalSink};
