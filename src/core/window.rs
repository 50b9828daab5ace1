//! Bounded block window
//!
//! The most recent accepted blocks, ascending by height, capped at a fixed
//! length. Each block links to its predecessor by id.

use crate::core::block::Block;
use std::collections::VecDeque;
use thiserror::Error;

/// Window consistency errors
#[derive(Error, Debug, PartialEq)]
pub enum WindowError {
    #[error("Block {id} at height {height} does not link to {expected}")]
    BrokenLink {
        id: String,
        height: u32,
        expected: String,
    },
    #[error("Block {id} at height {height} failed signature verification")]
    InvalidSignature { id: String, height: u32 },
}

/// The in-memory block window
#[derive(Debug, Clone)]
pub struct BlockWindow {
    blocks: VecDeque<Block>,
    capacity: usize,
}

impl BlockWindow {
    /// Create an empty window holding at most `capacity` blocks
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity.saturating_add(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Oldest block
    pub fn head(&self) -> Option<&Block> {
        self.blocks.front()
    }

    /// Newest block
    pub fn tail(&self) -> Option<&Block> {
        self.blocks.back()
    }

    pub fn height(&self) -> Option<u32> {
        self.tail().map(Block::height)
    }

    pub fn get_block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id() == id)
    }

    /// Newest first, optionally limited
    pub fn get_blocks(&self, limit: Option<usize>) -> Vec<Block> {
        let limit = limit.unwrap_or(self.blocks.len());
        self.blocks.iter().rev().take(limit).cloned().collect()
    }

    /// Blocks strictly above `height`, ascending
    pub fn blocks_after(&self, height: u32) -> Vec<Block> {
        self.blocks
            .iter()
            .filter(|b| b.height() > height)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Append a block, evicting the oldest if the cap is exceeded.
    ///
    /// Linkage is the caller's responsibility; see `ChainSync::add_block`.
    pub fn push(&mut self, block: Block) -> Option<Block> {
        self.blocks.push_back(block);
        if self.blocks.len() > self.capacity {
            self.blocks.pop_front()
        } else {
            None
        }
    }

    /// Replace the contents with `blocks`, sorted ascending and trimmed to
    /// the newest `capacity`. The window is left untouched if the result
    /// does not verify.
    pub fn replace(&mut self, mut blocks: Vec<Block>) -> Result<(), WindowError> {
        blocks.sort_by_key(Block::height);
        let excess = blocks.len().saturating_sub(self.capacity);
        let candidate: VecDeque<Block> = blocks.into_iter().skip(excess).collect();

        verify_sequence(candidate.iter())?;
        self.blocks = candidate;
        Ok(())
    }
}

fn verify_sequence<'a>(blocks: impl Iterator<Item = &'a Block>) -> Result<(), WindowError> {
    let mut previous: Option<&Block> = None;
    for block in blocks {
        if !block.data().verify_signature() {
            return Err(WindowError::InvalidSignature {
                id: block.id().to_string(),
                height: block.height(),
            });
        }
        if let Some(prev) = previous {
            if block.previous_block() != Some(prev.id()) {
                return Err(WindowError::BrokenLink {
                    id: block.id().to_string(),
                    height: block.height(),
                    expected: prev.id().to_string(),
                });
            }
        }
        previous = Some(block);
    }
    Ok(())
}
