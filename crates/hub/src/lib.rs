//! In-process stream hub: one broadcast channel per stream type plus the
//! bounded chart series cache, with filtered, combined and windowed views.

pub mod alerts;
pub mod export;
pub mod filter;
pub mod hub;
pub mod window;

pub use alerts::{AlertGenerator, AlertStream};
pub use export::{ExportRecord, TimeRange};
pub use filter::PacketFilter;
pub use hub::{HubState, PacketStream, StreamHub};
pub use window::time_windows;
