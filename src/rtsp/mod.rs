//! RTSP server (C6): TCP listener, per-connection request loop, method
//! dispatch, and the error-to-status-code mapping the rest of the crate's
//! error taxonomy is designed around.

mod server;

pub use server::{status_for_error, RtspServer};
