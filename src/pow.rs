//! NIP-13 style proof of work over record ids.
//!
//! Mining appends a `["nonce", N, target]` tag and bumps `N` until the record
//! id starts with at least `target` zero bits. The search is CPU bound; async
//! callers should go through [`mine_blocking`].

use std::ops::ControlFlow;

use crate::{
    error::PowError,
    event::{Record, Tag, UnsignedEvent},
};

pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10_000;

/// Parameters for one [`mine`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MineOptions {
    /// Required number of leading zero bits.
    pub target: u32,
    pub max_iterations: u64,
    pub start_nonce: u64,
    /// Iterations between progress callbacks.
    pub progress_interval: u64,
}

impl MineOptions {
    pub fn new(target: u32, max_iterations: u64) -> Self {
        MineOptions {
            target,
            max_iterations,
            start_nonce: 0,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MineProgress {
    pub nonce: u64,
    pub iterations: u64,
    pub best_difficulty: u32,
}

/// A record whose id meets the requested difficulty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mined {
    pub event: UnsignedEvent,
    pub nonce: u64,
    pub difficulty: u32,
}

/// Count leading zero bits of a hex string.
///
/// Whole `0` nibbles count four bits each; the first non-zero nibble adds its
/// own leading zeros. Non-hex characters stop the count.
pub fn count_leading_zero_bits(hex: &str) -> u32 {
    let mut bits = 0;
    for c in hex.chars() {
        let Some(nibble) = c.to_digit(16) else {
            break;
        };
        if nibble == 0 {
            bits += 4;
            continue;
        }
        bits += match nibble {
            1 => 3,
            2..=3 => 2,
            4..=7 => 1,
            _ => 0,
        };
        break;
    }
    bits
}

/// Difficulty actually achieved by a record.
pub fn difficulty<R: Record>(record: &R) -> u32 {
    count_leading_zero_bits(record.id())
}

/// `(nonce, claimed target)` of the first nonce tag, if well formed.
pub fn nonce_tag(tags: &[Tag]) -> Option<(u64, u32)> {
    let tag = tags.iter().find(|t| t.is("nonce"))?;
    let nonce = tag.get(1)?.parse().ok()?;
    let target = tag.get(2)?.parse().ok()?;
    Some((nonce, target))
}

/// True iff the record carries a nonce tag and meets the difficulty it claims.
pub fn validate<R: Record>(record: &R) -> bool {
    match nonce_tag(record.tags()) {
        Some((_, target)) => difficulty(record) >= target,
        None => false,
    }
}

/// Expected seconds to reach `target` at `hashes_per_second`.
pub fn estimate_seconds(target: u32, hashes_per_second: f64) -> f64 {
    2f64.powi(target as i32) / hashes_per_second
}

fn set_nonce(tags: &mut Vec<Tag>, slot: usize, nonce: u64, target: u32) {
    tags[slot] = Tag(vec!["nonce".into(), nonce.to_string(), target.to_string()]);
}

/// Search for a nonce giving `draft` at least `opts.target` leading zero bits.
///
/// An existing nonce tag is replaced in place, otherwise one is appended. The
/// callback fires every `progress_interval` iterations and once more when the
/// search ends; returning [`ControlFlow::Break`] aborts with
/// [`PowError::Cancelled`].
pub fn mine(
    draft: UnsignedEvent,
    opts: &MineOptions,
    mut on_progress: Option<&mut dyn FnMut(MineProgress) -> ControlFlow<()>>,
) -> Result<Mined, PowError> {
    let interval = opts.progress_interval.max(1);
    let mut event = draft;
    let slot = match event.tags.iter().position(|t| t.is("nonce")) {
        Some(i) => i,
        None => {
            event.tags.push(Tag(vec![]));
            event.tags.len() - 1
        }
    };

    let mut best = 0;
    let mut nonce = opts.start_nonce;
    let mut iterations = 0u64;
    while iterations < opts.max_iterations {
        set_nonce(&mut event.tags, slot, nonce, opts.target);
        event.id = event.compute_id();
        iterations += 1;
        let bits = count_leading_zero_bits(&event.id);
        best = best.max(bits);
        if bits >= opts.target {
            if let Some(cb) = on_progress.as_mut() {
                // Report the final state even when the target is hit early.
                let _ = cb(MineProgress {
                    nonce,
                    iterations,
                    best_difficulty: best,
                });
            }
            tracing::debug!(nonce, iterations, difficulty = bits, "proof of work found");
            return Ok(Mined {
                event,
                nonce,
                difficulty: bits,
            });
        }
        if iterations % interval == 0 {
            if let Some(cb) = on_progress.as_mut() {
                let progress = MineProgress {
                    nonce,
                    iterations,
                    best_difficulty: best,
                };
                if cb(progress).is_break() {
                    return Err(PowError::Cancelled { nonce, best });
                }
            }
        }
        nonce = nonce.wrapping_add(1);
    }
    tracing::debug!(target = opts.target, best, iterations, "proof of work budget exhausted");
    Err(PowError::PowNotReached {
        target: opts.target,
        best,
        iterations,
    })
}

/// Run [`mine`] on tokio's blocking pool.
pub async fn mine_blocking(draft: UnsignedEvent, opts: MineOptions) -> Result<Mined, PowError> {
    tokio::task::spawn_blocking(move || mine(draft, &opts, None))
        .await
        .map_err(|e| PowError::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> UnsignedEvent {
        UnsignedEvent::new("ab".repeat(32), 1_700_000_000, 1, vec![Tag::new(["t", "x"])], "hello")
    }

    #[test]
    fn leading_zero_bits() {
        assert_eq!(count_leading_zero_bits(&format!("000abc{}", "f".repeat(58))), 12);
        assert_eq!(count_leading_zero_bits(&"f".repeat(64)), 0);
        assert_eq!(count_leading_zero_bits(&"0".repeat(64)), 256);
        assert_eq!(count_leading_zero_bits("1f"), 3);
        assert_eq!(count_leading_zero_bits("0300"), 6);
        assert_eq!(count_leading_zero_bits("07"), 5);
        assert_eq!(count_leading_zero_bits("8"), 0);
        assert_eq!(count_leading_zero_bits("00A"), 8);
    }

    #[test]
    fn mine_reaches_target_and_validates() {
        let mined = mine(draft(), &MineOptions::new(8, 100_000), None).unwrap();
        assert!(mined.difficulty >= 8);
        assert!(validate(&mined.event));
        assert_eq!(mined.event.id, mined.event.compute_id());
        assert_eq!(nonce_tag(&mined.event.tags), Some((mined.nonce, 8)));
        // original tags untouched
        assert_eq!(mined.event.tags[0], Tag::new(["t", "x"]));
    }

    #[test]
    fn existing_nonce_tag_is_replaced() {
        let mut d = draft();
        d.tags.push(Tag::new(["nonce", "999", "1"]));
        let mined = mine(d, &MineOptions::new(4, 10_000), None).unwrap();
        let nonces = mined.event.tags.iter().filter(|t| t.is("nonce")).count();
        assert_eq!(nonces, 1);
        assert_eq!(mined.event.tags.len(), 2);
    }

    #[test]
    fn exhausted_budget_reports_best() {
        let err = mine(draft(), &MineOptions::new(64, 50), None).unwrap_err();
        match err {
            PowError::PowNotReached {
                target,
                best,
                iterations,
            } => {
                assert_eq!(target, 64);
                assert_eq!(iterations, 50);
                assert!(best < 64);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn progress_fires_even_when_found_early() {
        let mut calls = 0;
        let mut cb = |_: MineProgress| {
            calls += 1;
            ControlFlow::Continue(())
        };
        mine(draft(), &MineOptions::new(0, 10), Some(&mut cb)).unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn progress_can_cancel() {
        let opts = MineOptions {
            target: 64,
            max_iterations: 1_000,
            start_nonce: 0,
            progress_interval: 10,
        };
        let mut cb = |p: MineProgress| {
            if p.iterations >= 30 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let err = mine(draft(), &opts, Some(&mut cb)).unwrap_err();
        assert!(matches!(err, PowError::Cancelled { nonce: 29, .. }));
    }

    #[test]
    fn start_nonce_is_honoured() {
        let opts = MineOptions {
            start_nonce: 500,
            ..MineOptions::new(0, 1)
        };
        let mined = mine(draft(), &opts, None).unwrap();
        assert_eq!(mined.nonce, 500);
    }

    #[test]
    fn validate_requires_nonce_tag() {
        let mut ev = draft();
        assert!(!validate(&ev));
        ev = ev.with_tags(vec![Tag::new(["nonce", "1", "0"])]);
        assert!(validate(&ev));
        ev = ev.with_tags(vec![Tag::new(["nonce", "1", "255"])]);
        assert!(!validate(&ev));
    }

    #[test]
    fn estimate_doubles_per_bit() {
        assert_eq!(estimate_seconds(10, 1024.0), 1.0);
        assert_eq!(estimate_seconds(11, 1024.0), 2.0);
    }

    #[tokio::test]
    async fn mine_off_the_runtime() {
        let mined = mine_blocking(draft(), MineOptions::new(6, 100_000)).await.unwrap();
        assert!(validate(&mined.event));
    }
}
