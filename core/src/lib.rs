pub mod arbiter;
pub mod backend;
pub mod definitions;
pub mod errors;
pub mod protocol;
pub mod queue;
pub mod resync;
pub mod settings;
pub mod state_cache;

mod connection;
mod service;

#[cfg(test)]
mod testing;

pub use arbiter::{Arbiter, ArbiterConfig, ArbiterSnapshot, Backends, LightHandle, RetryPolicy};
pub use backend::{
    BackendEvent, CompanionBackend, CompanionConfig, ConnectOptions, DeviceBackend, DirectBackend,
    LedDevice, ProxyBackend, ProxyControl,
};
pub use definitions::{ArbitrationPolicy, Authority, BackendKind, LedColor, LightEvent, Rgb};
pub use errors::{BackendError, ControlError, SettingsError};
pub use protocol::FrameStyle;
pub use service::{spawn_service, ServiceHandle, StopHandle};
pub use settings::{JsonFileSettingsStore, MemorySettingsStore, Settings, SettingsStore};
pub use state_cache::LogicalState;
