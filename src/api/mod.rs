//! REST API module
//!
//! # Endpoints
//!
//! ## Peer protocol
//! - `GET /peer/status` - Height, slot and tip header
//! - `GET /peer/blocks?lastBlockHeight=h` - Window blocks above `h`
//! - `POST /peer/blocks` - Announce a block
//! - `ANY /peer/list` - Alive peers
//!
//! ## Public
//! - `ANY /api/peers`, `GET /api/peers/version`
//! - `GET /api/blocks/getHeight`, `GET /api/blocks/get?id=`, `GET /api/blocks?limit=`
//! - `GET /health` - Node status
//!
//! Anything else is proxied to the anchor or a random alive peer.

pub mod handlers;
pub mod routes;

pub use handlers::ApiState;
pub use routes::create_router;
