//! Shared utilities: socket binding helpers and a log-rate throttle.

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, bind_udp_socket};
pub use throttle::LogThrottler;
