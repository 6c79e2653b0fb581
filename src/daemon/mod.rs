// Daemon modules
pub mod events;
pub mod service;

// Re-export commonly used types
pub use events::{NetworkEvent, NetworkEventBus};
pub use service::{open_stores, shutdown_signal, system_state, Daemon, DaemonSettings, HeartbeatWatcher};
