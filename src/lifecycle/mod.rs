//! Process lifecycle: shutdown signalling and background-task collection.

pub mod shutdown;

pub use shutdown::Shutdown;
