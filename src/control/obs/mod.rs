//! obs-websocket 5.x transport.

mod client;
pub mod protocol;

pub use client::{ObsClient, ObsConnector, ObsEndpoint};
