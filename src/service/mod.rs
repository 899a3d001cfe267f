pub mod daemon;
pub mod reconciler;
pub mod signals;

pub use daemon::ServiceManager;
pub use reconciler::{ControllerHandle, LoopState, Reconciler, ReconcilerOptions, SnapshotHandle};
pub use signals::{SignalHandler, SignalType};
