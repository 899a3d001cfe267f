pub mod catalog;
pub mod classifier;
pub mod device;
pub mod module_args;
pub mod planner;
pub mod presence;

pub use catalog::{
    BluetoothPeer, Card, CatalogSnapshot, CompanionStream, CorrelationMap, DeviceCatalog, Sink,
    Source,
};
pub use classifier::{Classification, Classifier, ProfileSelection};
pub use device::{
    AlsaCard, BluetoothPeerInfo, CardInfo, CardProfile, CompanionKind, InputClass, ModuleInfo,
    ModuleKind, OutputClass, PortInfo, RoutingModule, SinkInfo, SourceInfo, SourceKind,
    StreamInfo,
};
pub use module_args::ModuleArgs;
pub use planner::{Activation, Plan, RoutingOp, RoutingPlanner, VolumeTarget};
