pub mod api;
pub mod capture;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod infra;
pub mod logging;
pub mod model;
pub mod offline;
pub mod qr;
pub mod scanner;
pub mod stream;

pub use capture::{CaptureOutcome, CapturePipeline};
pub use config::ClientConfig;
pub use context::ClientContext;
pub use error::{Result, ScanError};
pub use infra::ConnectivityMonitor;
pub use model::*;
pub use offline::{LocalEventQueue, SyncEngine, SyncOutcome};
pub use qr::{QrVerifier, VerificationOutcome};
pub use stream::{LiveViewState, StreamListener};
