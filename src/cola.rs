//! Constant overlap-add (COLA) chunking.
//!
//! A channel is split into overlapping windows; each processed window is
//! weighted and summed back at its start offset. The per-chunk weights form
//! an exact partition of unity, so the identity transform reconstructs the
//! input bit-for-bit up to rounding.

use crate::error::{NotchError, Result};

/// One analysis window: start offset plus its overlap-add weight vector
/// (whose length is the chunk length).
#[derive(Debug, Clone)]
pub struct ColaChunk {
    pub start: usize,
    pub weight: Vec<f64>,
}

impl ColaChunk {
    pub fn len(&self) -> usize {
        self.weight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weight.is_empty()
    }

    pub fn end(&self) -> usize {
        self.start + self.weight.len()
    }
}

/// Window layout for one channel length: chunk offsets and weights, computed
/// once and shared by every channel of the same length.
#[derive(Debug, Clone)]
pub struct ColaPlan {
    chunks: Vec<ColaChunk>,
    n_total: usize,
    n_overlap: usize,
}

impl ColaPlan {
    /// Plan windows of `n_samples` over a `n_total`-sample channel with
    /// overlap `(n_samples + 1) / 2`. The final window is clipped to the
    /// remaining samples.
    pub fn new(n_total: usize, n_samples: usize) -> Result<Self> {
        if n_total == 0 {
            return Err(NotchError::InvalidInput("signal has no samples".into()));
        }
        if n_samples == 0 {
            return Err(NotchError::InvalidParameter(
                "chunk length must be at least 1 sample".into(),
            ));
        }
        let n_samples = n_samples.min(n_total);
        let n_overlap = (n_samples + 1) / 2;
        let hop = n_samples - n_overlap;

        let mut spans: Vec<(usize, usize)> = Vec::new();
        if n_samples == n_total {
            spans.push((0, n_total));
        } else {
            if hop == 0 {
                return Err(NotchError::InvalidParameter(format!(
                    "chunk length of {n_samples} sample(s) is too short to overlap"
                )));
            }
            let mut start = 0;
            loop {
                if start + n_samples >= n_total {
                    spans.push((start, n_total - start));
                    break;
                }
                spans.push((start, n_samples));
                start += hop;
            }
        }

        // Linear crossfade ramps over each overlap region, flat elsewhere.
        let n_chunks = spans.len();
        let mut weights: Vec<Vec<f64>> = Vec::with_capacity(n_chunks);
        for (i, &(start, len)) in spans.iter().enumerate() {
            let left = if i == 0 {
                0
            } else {
                (spans[i - 1].0 + spans[i - 1].1).saturating_sub(start)
            };
            let right = if i + 1 == n_chunks {
                0
            } else {
                (start + len).saturating_sub(spans[i + 1].0)
            };
            let weight: Vec<f64> = (0..len)
                .map(|j| {
                    let up = if j < left {
                        (j + 1) as f64 / (left + 1) as f64
                    } else {
                        1.0
                    };
                    let down = if j >= len - right {
                        (len - j) as f64 / (right + 1) as f64
                    } else {
                        1.0
                    };
                    up.min(down)
                })
                .collect();
            weights.push(weight);
        }

        // Normalize so the weights sum to exactly 1 at every sample, even
        // where an odd window length makes three chunks meet.
        let mut total = vec![0.0; n_total];
        for (&(start, _), weight) in spans.iter().zip(&weights) {
            for (j, w) in weight.iter().enumerate() {
                total[start + j] += w;
            }
        }
        for (&(start, _), weight) in spans.iter().zip(weights.iter_mut()) {
            for (j, w) in weight.iter_mut().enumerate() {
                *w /= total[start + j];
            }
        }

        let chunks = spans
            .into_iter()
            .zip(weights)
            .map(|((start, _), weight)| ColaChunk { start, weight })
            .collect();
        Ok(Self {
            chunks,
            n_total,
            n_overlap,
        })
    }

    pub fn chunks(&self) -> &[ColaChunk] {
        &self.chunks
    }

    pub fn n_total(&self) -> usize {
        self.n_total
    }

    pub fn n_overlap(&self) -> usize {
        self.n_overlap
    }
}

/// Output buffer with a forward-only write cursor.
///
/// Owns the accumulation state explicitly instead of hiding it in closures;
/// chunks must arrive left to right, and the cursor has to land exactly on
/// the channel length when finished.
#[derive(Debug)]
pub struct ColaAccumulator {
    out: Vec<f64>,
    cursor: usize,
}

impl ColaAccumulator {
    pub fn new(n_total: usize) -> Self {
        Self {
            out: vec![0.0; n_total],
            cursor: 0,
        }
    }

    /// Add a weighted, processed chunk at its start offset.
    pub fn push(&mut self, start: usize, chunk: &[f64]) -> Result<()> {
        let stop = start + chunk.len();
        if start > self.cursor || stop < self.cursor || stop > self.out.len() {
            return Err(NotchError::Consistency(format!(
                "chunk [{start}, {stop}) breaks the forward-only write order at cursor {} of {}",
                self.cursor,
                self.out.len()
            )));
        }
        for (i, &value) in chunk.iter().enumerate() {
            self.out[start + i] += value;
        }
        self.cursor = stop;
        Ok(())
    }

    /// Finish accumulation; the cursor must have covered the whole channel.
    pub fn finish(self) -> Result<Vec<f64>> {
        if self.cursor != self.out.len() {
            return Err(NotchError::Consistency(format!(
                "overlap-add ended at sample {} of {}",
                self.cursor,
                self.out.len()
            )));
        }
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight_sums(plan: &ColaPlan) -> Vec<f64> {
        let mut total = vec![0.0; plan.n_total()];
        for chunk in plan.chunks() {
            for (j, w) in chunk.weight.iter().enumerate() {
                total[chunk.start + j] += w;
            }
        }
        total
    }

    #[test]
    fn weights_partition_unity() {
        for (n_total, n_samples) in [(1000, 300), (1000, 1000), (997, 251), (100, 7), (50, 3)] {
            let plan = ColaPlan::new(n_total, n_samples).unwrap();
            for (i, &sum) in weight_sums(&plan).iter().enumerate() {
                assert!(
                    (sum - 1.0).abs() < 1e-12,
                    "sum {sum} at sample {i} for ({n_total}, {n_samples})"
                );
            }
        }
    }

    #[test]
    fn chunks_cover_the_signal_in_order() {
        let plan = ColaPlan::new(1000, 300).unwrap();
        let chunks = plan.chunks();
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end(), 1000);
        for pair in chunks.windows(2) {
            assert!(pair[1].start > pair[0].start);
            assert!(pair[1].start < pair[0].end(), "gap between chunks");
        }
        assert_eq!(plan.n_overlap(), 150);
    }

    #[test]
    fn identity_transform_reconstructs_exactly() {
        let x: Vec<f64> = (0..997).map(|i| (i as f64 * 0.13).sin() + 0.2).collect();
        let plan = ColaPlan::new(x.len(), 251).unwrap();
        let mut acc = ColaAccumulator::new(x.len());
        for chunk in plan.chunks() {
            let weighted: Vec<f64> = x[chunk.start..chunk.end()]
                .iter()
                .zip(&chunk.weight)
                .map(|(&v, &w)| v * w)
                .collect();
            acc.push(chunk.start, &weighted).unwrap();
        }
        let out = acc.finish().unwrap();
        for (a, b) in x.iter().zip(&out) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn single_chunk_has_unit_weight() {
        let plan = ColaPlan::new(500, 2000).unwrap();
        assert_eq!(plan.chunks().len(), 1);
        assert!(plan.chunks()[0].weight.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn out_of_order_writes_are_a_consistency_error() {
        let mut acc = ColaAccumulator::new(100);
        acc.push(0, &vec![0.0; 60]).unwrap();
        // a gap past the cursor is rejected
        assert!(acc.push(70, &vec![0.0; 30]).is_err());

        let mut acc = ColaAccumulator::new(100);
        acc.push(0, &vec![0.0; 60]).unwrap();
        acc.push(30, &vec![0.0; 70]).unwrap();
        assert!(acc.finish().is_ok());

        let mut acc = ColaAccumulator::new(100);
        acc.push(0, &vec![0.0; 60]).unwrap();
        assert!(acc.finish().is_err());
    }
}
