pub mod shutdown;
pub mod supervisor;
pub mod uploader;
pub mod worker;

pub use shutdown::Shutdown;
pub use supervisor::{CameraSupervisor, RestartPolicy, WorkerContext};
pub use uploader::{CollectorResponse, CollectorTransport, FrameUpload, HttpTransport, Uploader};
pub use worker::{FrameOutcome, StreamWorker, WorkerState, WorkerStats};
