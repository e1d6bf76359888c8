pub mod graceful_shutdown;

pub use graceful_shutdown::{ShutdownSignal, wait_for_interrupt};
