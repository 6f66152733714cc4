//! Brute-force descriptor matching with the nearest/second-nearest ratio test.

use super::features::{hamming, Descriptor};

/// One surviving correspondence between a query and a train descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// For each query descriptor, finds its two nearest train descriptors and keeps
/// the nearest only when it is clearly better than the runner-up
/// (`best < ratio * second`) and within `max_distance`.
pub fn match_descriptors(
    query: &[Descriptor],
    train: &[Descriptor],
    ratio: f32,
    max_distance: u32,
) -> Vec<FeatureMatch> {
    if train.len() < 2 {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for (query_idx, q) in query.iter().enumerate() {
        let mut best = (u32::MAX, 0usize);
        let mut second = u32::MAX;
        for (train_idx, t) in train.iter().enumerate() {
            let d = hamming(q, t);
            if d < best.0 {
                second = best.0;
                best = (d, train_idx);
            } else if d < second {
                second = d;
            }
        }

        if best.0 <= max_distance && (best.0 as f32) < ratio * second as f32 {
            matches.push(FeatureMatch {
                query_idx,
                train_idx: best.1,
                distance: best.0,
            });
        }
    }
    matches
}
