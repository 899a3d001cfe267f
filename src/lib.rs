pub mod audio;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod service;
pub mod system;

pub use config::Config;
pub use error::ServerError;
pub use service::{ControllerHandle, LoopState, Reconciler};
