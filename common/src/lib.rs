//! Types shared by the aerocam crates: configuration, the camera catalog,
//! camera keys and the JSON protocol.

pub mod cameras;
pub mod config;
pub mod key;
pub mod protocol;
