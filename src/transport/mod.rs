//! Device-facing transports.
//!
//! Audio reaches the gateway over encrypted UDP or a WebSocket; replies
//! leave through the outbound router, which fans out to whichever routes
//! the device currently holds.

pub mod registry;
pub mod router;
pub mod udp;
pub mod ws;

pub use registry::{ConnectionHandle, ConnectionRegistry, WsOutbound};
pub use router::OutboundRouter;
pub use udp::{UdpAudioServer, UdpOutbound};
pub use ws::{WsControlPublisher, ws_device_handler};
