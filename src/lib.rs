//! voicegrid - presence, proximity, and signaling backend for proximity voice
//!
//! Players report positions over a per-cell WebSocket channel; each cell is
//! owned by a single actor that computes audibility neighborhoods, pushes
//! membership and distance diffs, and relays opaque negotiation payloads
//! between registered players. An HTTP admission endpoint maps a position to
//! a cell, mints a one-time session token, and hands out relay-server
//! credentials for the media transport. The `client` module carries the
//! matching channel client and the peer-selection layer that decides which
//! reported neighbors actually get a media link.

pub mod app;
pub mod client;
pub mod config;
pub mod geo;
pub mod http;
pub mod ice;
pub mod shard;
pub mod util;
pub mod ws;
