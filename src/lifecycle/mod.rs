//! Process lifecycle concerns

mod shutdown;

pub use shutdown::ShutdownSignal;
