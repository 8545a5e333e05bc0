//! Utility modules shared by the relay

pub mod net;
pub mod throttle;

pub use net::bind_udp_socket;
pub use throttle::LogThrottler;
