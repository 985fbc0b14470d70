//! HMM transition matrices, stored as one flat buffer of log probabilities with computed
//! strides: `n_tmat x n_state x (n_state + 1)` where the extra destination column is the
//! non-emitting exit state. Probabilities are floored, renormalized and converted to the shared
//! integer log domain at load time so the search only ever adds.
use crate::error::{Error, Result};
use crate::logmath::{LogMath, WORST_SCORE};
use crate::s3file::S3File;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Tmat {
    tp: Vec<i32>,
    n_tmat: usize,
    /// Emitting (source) states; destinations run one further for the exit state.
    n_state: usize,
}

impl Tmat {
    pub fn load(path: impl AsRef<Path>, lmath: &LogMath, floor: f64) -> Result<Self> {
        let mut s3 = S3File::open(path.as_ref())?;
        s3.parse_header(Some("1.0"))?;
        let (data, dims) = s3.get_3d_f32()?;
        s3.verify_chksum()?;
        Self::from_probs(data, dims, lmath, floor, path.as_ref())
    }

    pub fn from_probs(
        data: Vec<f32>,
        [n_tmat, n_src, n_dst]: [usize; 3],
        lmath: &LogMath,
        floor: f64,
        path: &Path,
    ) -> Result<Self> {
        if n_dst != n_src + 1 {
            return Err(Error::model(
                path,
                format!("transition matrix is {n_src}x{n_dst}, expected destinations = sources + 1"),
            ));
        }
        let mut tp = vec![WORST_SCORE; n_tmat * n_src * n_dst];
        for t in 0..n_tmat {
            for i in 0..n_src {
                let row = &data[(t * n_src + i) * n_dst..(t * n_src + i + 1) * n_dst];
                let sum: f64 = row.iter().map(|&p| p as f64).sum();
                if !(0.9..=1.1).contains(&sum) {
                    return Err(Error::model(
                        path,
                        format!("tmat {t} row {i} sums to {sum}, not a distribution"),
                    ));
                }
                // Left-to-right topology: probability mass flowing backwards would break the
                // in-place Viterbi update, so it is rejected rather than silently floored.
                if row[..i].iter().any(|&p| p > 0.0) {
                    return Err(Error::model(
                        path,
                        format!("tmat {t} row {i} has a backward transition"),
                    ));
                }
                // Floor the transitions that exist, then renormalize.
                let floored: Vec<f64> = row
                    .iter()
                    .map(|&p| if p > 0.0 { (p as f64).max(floor) } else { 0.0 })
                    .collect();
                let norm: f64 = floored.iter().sum();
                if norm <= 0.0 {
                    warn!("tmat {t} row {i} is empty, leaving it unreachable");
                    continue;
                }
                for (j, &p) in floored.iter().enumerate() {
                    if p > 0.0 {
                        tp[(t * n_src + i) * n_dst + j] = lmath.log(p / norm);
                    }
                }
            }
        }
        info!(n_tmat, n_state = n_src, "transition matrices loaded");
        Ok(Self {
            tp,
            n_tmat,
            n_state: n_src,
        })
    }

    pub fn n_tmat(&self) -> usize {
        self.n_tmat
    }

    pub fn n_state(&self) -> usize {
        self.n_state
    }

    /// Log probability of `from -> to` in matrix `t`; `to == n_state` is the exit state.
    #[inline]
    pub fn prob(&self, t: u32, from: usize, to: usize) -> i32 {
        debug_assert!((t as usize) < self.n_tmat);
        debug_assert!(from < self.n_state && to <= self.n_state);
        self.tp[(t as usize * self.n_state + from) * (self.n_state + 1) + to]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Standard 3-state Bakis topology with self-loops and single skips.
    pub(crate) fn toy_tmat(lmath: &LogMath, n_tmat: usize) -> Tmat {
        let row0 = [0.6f32, 0.3, 0.1, 0.0];
        let row1 = [0.0f32, 0.6, 0.3, 0.1];
        let row2 = [0.0f32, 0.0, 0.7, 0.3];
        let mut data = Vec::new();
        for _ in 0..n_tmat {
            data.extend_from_slice(&row0);
            data.extend_from_slice(&row1);
            data.extend_from_slice(&row2);
        }
        Tmat::from_probs(data, [n_tmat, 3, 4], lmath, 1e-4, &PathBuf::from("<toy>")).unwrap()
    }

    #[test]
    fn probs_round_trip_through_log() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let tm = toy_tmat(&lmath, 2);
        assert_eq!(tm.n_state(), 3);
        let p = lmath.exp(tm.prob(1, 0, 0));
        assert!((p - 0.6).abs() < 1e-3);
        let p = lmath.exp(tm.prob(0, 2, 3));
        assert!((p - 0.3).abs() < 1e-3);
    }

    #[test]
    fn missing_transitions_are_worst() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let tm = toy_tmat(&lmath, 1);
        assert_eq!(tm.prob(0, 2, 0), WORST_SCORE);
        assert_eq!(tm.prob(0, 1, 0), WORST_SCORE);
    }

    #[test]
    fn backward_transitions_rejected() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let data = vec![
            0.5f32, 0.5, 0.0, 0.0, //
            0.5, 0.5, 0.0, 0.0, // mass from state 1 back to 0
            0.0, 0.0, 0.5, 0.5,
        ];
        assert!(Tmat::from_probs(data, [1, 3, 4], &lmath, 1e-4, &PathBuf::from("<t>")).is_err());
    }

    #[test]
    fn non_distribution_rejected() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let data = vec![
            0.5f32, 0.1, 0.0, 0.0, //
            0.0, 0.6, 0.3, 0.1, //
            0.0, 0.0, 0.7, 0.3,
        ];
        assert!(Tmat::from_probs(data, [1, 3, 4], &lmath, 1e-4, &PathBuf::from("<t>")).is_err());
    }
}
