//! Boot runs and the state they share

pub mod blobs;
pub mod engine;
pub mod names;
pub mod progress;

pub use blobs::{BlobCache, DirectoryProvider, FileProvider, MemoryProvider};
pub use engine::{
    BootContext, BootEngine, BootOutcome, BootStage, BootTiming, file_server_progress,
};
pub use names::DeviceNames;
pub use progress::ProgressTable;
