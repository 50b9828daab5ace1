//! Consensus reconciliation
//!
//! Given the block lists reported by several peers, pick the one most likely
//! to be canonical. The first respondent seeds the candidate; each later
//! respondent is compared against the candidate's tip:
//!
//! - same height, different signature: a verified challenger with an earlier
//!   timestamp takes over (divergence)
//! - higher tip that verifies: challenger takes over (divergence)
//! - higher tip that does not verify: ignored, but counted as divergence
//! - anything else agrees with the candidate
//!
//! If divergences exceed `QUORUM_THRESHOLD` of the respondents there is no
//! usable majority.

use crate::core::block::BlockData;

/// Fraction of respondents that may diverge before the network is considered forked
pub const QUORUM_THRESHOLD: f64 = 0.51;

/// How a respondent compared with the running candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Agrees,
    /// Replaced the candidate
    Overtook,
    /// Lost a same-height tie-break
    Orphaned,
    /// Reported a higher tip whose signature does not verify
    Invalid,
}

/// Result of reconciling peer reports
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// `candidate` indexes the winning report
    Agreed {
        candidate: usize,
        diverged: usize,
        agreeing: Vec<usize>,
    },
    NoQuorum {
        diverged: usize,
        responders: usize,
    },
}

fn tip(blocks: &[BlockData]) -> Option<&BlockData> {
    blocks.iter().max_by_key(|b| b.height)
}

/// Compare a challenger's tip against the current candidate's tip
pub fn judge(candidate: &BlockData, challenger: &BlockData) -> Verdict {
    if challenger.height == candidate.height
        && challenger.block_signature != candidate.block_signature
    {
        if challenger.timestamp < candidate.timestamp && challenger.verify_signature() {
            Verdict::Overtook
        } else {
            Verdict::Orphaned
        }
    } else if challenger.height > candidate.height {
        if challenger.verify_signature() {
            Verdict::Overtook
        } else {
            Verdict::Invalid
        }
    } else {
        Verdict::Agrees
    }
}

/// Reconcile peer reports. Empty reports are skipped and do not count as respondents.
pub fn reconcile(reports: &[Vec<BlockData>]) -> Option<Reconciliation> {
    let mut candidate: Option<usize> = None;
    let mut diverged = 0;
    let mut responders = 0;
    let mut agreeing = Vec::new();

    for (index, blocks) in reports.iter().enumerate() {
        let Some(latest) = tip(blocks) else {
            continue;
        };
        responders += 1;

        let Some(current) = candidate else {
            candidate = Some(index);
            agreeing.push(index);
            continue;
        };

        let Some(current_tip) = tip(&reports[current]) else {
            continue;
        };
        match judge(current_tip, latest) {
            Verdict::Agrees => agreeing.push(index),
            Verdict::Overtook => {
                log::info!(
                    "Peer chain at height {} overtakes candidate {} at height {}",
                    latest.height,
                    current_tip.id,
                    current_tip.height
                );
                diverged += 1;
                candidate = Some(index);
            }
            Verdict::Invalid => diverged += 1,
            Verdict::Orphaned => {}
        }
    }

    let candidate = candidate?;
    if diverged as f64 > responders as f64 * QUORUM_THRESHOLD {
        return Some(Reconciliation::NoQuorum {
            diverged,
            responders,
        });
    }

    Some(Reconciliation::Agreed {
        candidate,
        diverged,
        agreeing,
    })
}
