//! Core chain components
//!
//! - Block headers and their verified form
//! - Binary codec, block ids and signature verification
//! - The bounded block window
//! - Consensus reconciliation across peer reports
//! - Forging slot arithmetic

pub mod block;
pub mod codec;
pub mod consensus;
pub mod slot;
pub mod window;

pub use block::{Block, BlockData, BlockError};
pub use codec::{CodecError, DecodedBlock, HEADER_SIZE};
pub use consensus::{reconcile, Reconciliation, Verdict, QUORUM_THRESHOLD};
pub use window::{BlockWindow, WindowError};
