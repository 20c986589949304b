//! Aerocam Web – stale-while-revalidate webcam cache behind an axum server.
//!
//! A read goes `routes` → `coordinator`, which serves from `cache`, and when
//! the frame is stale consults `breaker` and `lock` before handing a
//! refresh to a detached task that drives an `aerocam_capture` fetcher.

pub mod breaker;
pub mod cache;
pub mod coordinator;
pub mod lock;
pub mod placeholder;
pub mod registry;
pub mod routes;
pub mod transcode;
