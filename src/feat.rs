//! Feature computation: cepstral mean normalization, delta and delta-delta windows, and an
//! optional LDA projection.
//!
//! Deltas use a +/-2 frame difference and delta-deltas are the difference of the neighboring
//! deltas, dd[t] = d[t+1] - d[t-1], which reaches +/-3 frames. A seven-deep ring of cepstra
//! yields one output vector per input frame once primed; utterance edges replicate the boundary
//! frame so the feature stream is exactly as long as the cepstral stream.
//!
//! Live CMN subtracts a running mean that survives across utterances: a fresh decoder starts
//! from the configured prior and every utterance refines it, which is what keeps the first
//! second of a session from decoding against a wildly wrong mean.
use crate::config::{CmnKind, Config};
use crate::error::{Error, Result};
use crate::s3file::S3File;
use ndarray::{Array1, Array2};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, info};

/// Delta-delta reach in frames; the ring holds `2 * WINDOW + 1` cepstra.
const WINDOW: usize = 3;

/// Accumulator frame count that triggers halving, keeping an effective window of roughly 500
/// frames.
const CMN_HWM: u32 = 800;
const CMN_WIN: u32 = 500;

#[derive(Debug, Clone)]
struct CmnLive {
    mean: Vec<f32>,
    sum: Vec<f32>,
    var_sum: Vec<f32>,
    nframe: u32,
    varnorm: bool,
}

impl CmnLive {
    fn new(init: Vec<f32>, varnorm: bool) -> Self {
        let n = init.len();
        Self {
            mean: init,
            sum: vec![0.0; n],
            var_sum: vec![0.0; n],
            nframe: 0,
            varnorm,
        }
    }

    fn run(&mut self, cep: &mut [f32]) {
        for (i, c) in cep.iter_mut().enumerate() {
            self.sum[i] += *c;
            *c -= self.mean[i];
            if self.varnorm {
                self.var_sum[i] += *c * *c;
                let sd = (self.var_sum[i] / (self.nframe + 1) as f32).sqrt();
                if sd > 1e-5 {
                    *c /= sd;
                }
            }
        }
        self.nframe += 1;
        if self.nframe >= CMN_HWM {
            self.shrink();
        }
    }

    /// Fold the accumulated sum into the mean, decaying history so the window stays bounded.
    fn update(&mut self) {
        if self.nframe == 0 {
            return;
        }
        for (m, s) in self.mean.iter_mut().zip(self.sum.iter_mut()) {
            *m = *s / self.nframe as f32;
            *s = *m * CMN_WIN as f32;
        }
        for v in self.var_sum.iter_mut() {
            *v = *v / self.nframe as f32 * CMN_WIN as f32;
        }
        self.nframe = CMN_WIN;
        debug!(mean = ?self.mean, "cmn update");
    }

    fn shrink(&mut self) {
        for s in self.sum.iter_mut() {
            *s *= 0.5;
        }
        for v in self.var_sum.iter_mut() {
            *v *= 0.5;
        }
        self.nframe /= 2;
    }
}

pub struct FeatureTransform {
    ncep: usize,
    out_dim: usize,
    lda: Option<Array2<f32>>,
    cmn: Option<CmnLive>,
    ring: VecDeque<Vec<f32>>,
    started: bool,
}

impl FeatureTransform {
    pub fn new(config: &Config) -> Result<Self> {
        let ncep = config.ncep;
        let base_dim = ncep * 3;
        let lda = match &config.lda {
            Some(path) => Some(load_lda(path, base_dim, config.ldadim)?),
            None => None,
        };
        let out_dim = lda.as_ref().map(|m| m.nrows()).unwrap_or(base_dim);
        let cmn = match config.cmn {
            CmnKind::None => None,
            // Batch CMN needs the whole utterance up front; the live estimator converges to the
            // same place and works for streaming, so both map here.
            CmnKind::Live | CmnKind::Batch => {
                Some(CmnLive::new(config.cmn_init_vec()?, config.varnorm))
            }
        };
        info!(out_dim, lda = lda.is_some(), "feature transform ready");
        Ok(Self {
            ncep,
            out_dim,
            lda,
            cmn,
            ring: VecDeque::with_capacity(2 * WINDOW + 1),
            started: false,
        })
    }

    pub fn output_size(&self) -> usize {
        self.out_dim
    }

    /// Reset the delta window for a new utterance. The CMN estimate deliberately survives.
    pub fn start_utt(&mut self) {
        self.ring.clear();
        self.started = false;
    }

    /// Push one cepstral frame; appends any feature vectors that became computable.
    pub fn process_cep(&mut self, mut cep: Vec<f32>, out: &mut Vec<Array1<f32>>) {
        debug_assert_eq!(cep.len(), self.ncep);
        if let Some(cmn) = &mut self.cmn {
            cmn.run(&mut cep);
        }
        if !self.started {
            // Prime the left edge by replicating the first frame.
            for _ in 0..WINDOW {
                self.ring.push_back(cep.clone());
            }
            self.started = true;
        }
        self.push(cep, out);
    }

    /// Flush the right edge by replicating the final frame, then fold CMN statistics.
    pub fn end_utt(&mut self, out: &mut Vec<Array1<f32>>) {
        if self.started {
            for _ in 0..WINDOW {
                let last = self.ring.back().cloned().unwrap();
                self.push(last, out);
            }
        }
        if let Some(cmn) = &mut self.cmn {
            cmn.update();
        }
        self.ring.clear();
        self.started = false;
    }

    fn push(&mut self, cep: Vec<f32>, out: &mut Vec<Array1<f32>>) {
        self.ring.push_back(cep);
        if self.ring.len() == 2 * WINDOW + 1 {
            out.push(self.compute());
            self.ring.pop_front();
        }
    }

    fn compute(&self) -> Array1<f32> {
        let r = &self.ring;
        let n = self.ncep;
        let mut feat = Vec::with_capacity(n * 3);
        // Center sits at index WINDOW; offsets below are relative to it.
        let c = WINDOW;
        feat.extend_from_slice(&r[c]);
        for i in 0..n {
            feat.push(r[c + 2][i] - r[c - 2][i]);
        }
        for i in 0..n {
            let d_next = r[c + 3][i] - r[c - 1][i];
            let d_prev = r[c + 1][i] - r[c - 3][i];
            feat.push(d_next - d_prev);
        }
        let feat = Array1::from_vec(feat);
        match &self.lda {
            Some(m) => m.dot(&feat),
            None => feat,
        }
    }
}

fn load_lda(path: &Path, in_dim: usize, ldadim: usize) -> Result<Array2<f32>> {
    let mut s3 = S3File::open(path)?;
    s3.parse_header(None)?;
    let (data, [n_lda, rows, cols]) = s3.get_3d_f32()?;
    s3.verify_chksum()?;
    if n_lda < 1 || cols != in_dim {
        return Err(Error::model(
            path,
            format!("LDA shape {n_lda}x{rows}x{cols} does not project a {in_dim}-dim feature"),
        ));
    }
    let rows_used = if ldadim > 0 {
        if ldadim > rows {
            return Err(Error::model(
                path,
                format!("ldadim {ldadim} exceeds LDA rows {rows}"),
            ));
        }
        ldadim
    } else {
        rows
    };
    let matrix = Array2::from_shape_vec((rows, cols), data[..rows * cols].to_vec())
        .expect("shape already checked");
    Ok(matrix.slice_move(ndarray::s![..rows_used, ..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut c = Config::default();
        c.ncep = 2;
        c.cmninit = "0".into();
        c
    }

    fn no_cmn_cfg() -> Config {
        let mut c = cfg();
        c.cmn = CmnKind::None;
        c
    }

    fn run(ft: &mut FeatureTransform, ceps: &[Vec<f32>]) -> Vec<Array1<f32>> {
        let mut out = Vec::new();
        ft.start_utt();
        for c in ceps {
            ft.process_cep(c.clone(), &mut out);
        }
        ft.end_utt(&mut out);
        out
    }

    #[test]
    fn one_feature_per_cepstrum() {
        let mut ft = FeatureTransform::new(&no_cmn_cfg()).unwrap();
        for n in [1usize, 2, 6, 7, 50] {
            let ceps: Vec<Vec<f32>> = (0..n).map(|i| vec![i as f32, 0.0]).collect();
            let out = run(&mut ft, &ceps);
            assert_eq!(out.len(), n, "{n} cepstra");
            assert!(out.iter().all(|f| f.len() == 6));
        }
    }

    #[test]
    fn delta_definitions_on_a_ramp() {
        // cep[t] = t: d[t] = (t+2) - (t-2) = 4, dd[t] = d[t+1] - d[t-1] = 0 in the interior.
        let ceps: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32, 2.0 * i as f32]).collect();
        let mut ft = FeatureTransform::new(&no_cmn_cfg()).unwrap();
        let out = run(&mut ft, &ceps);
        let mid = &out[10];
        assert_eq!(mid[0], 10.0);
        assert_eq!(mid[1], 20.0);
        assert_eq!(mid[2], 4.0);
        assert_eq!(mid[3], 8.0);
        assert_eq!(mid[4], 0.0);
        assert_eq!(mid[5], 0.0);
    }

    #[test]
    fn golden_delta_values() {
        // Hand-computed reference pinning dd[t] = d[t+1] - d[t-1] (and not the other readings of
        // the delta-delta definition floating around).
        let vals = [3.0f32, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0, 5.0, 3.0];
        let ceps: Vec<Vec<f32>> = vals.iter().map(|&v| vec![v, 0.0]).collect();
        let mut ft = FeatureTransform::new(&no_cmn_cfg()).unwrap();
        let out = run(&mut ft, &ceps);
        assert_eq!(out.len(), 10);
        // t=4: d = cep[6] - cep[2] = 2 - 4 = -2.
        assert_eq!(out[4][2], -2.0);
        // t=4: dd = (cep[7] - cep[3]) - (cep[5] - cep[1]) = (6 - 1) - (9 - 1) = -3.
        assert_eq!(out[4][4], -3.0);
        // Left edge replicates frame 0: t=0 sees cep[-k] = 3.0.
        // d[0] = cep[2] - 3 = 1; dd[0] = (cep[3] - 3) - (cep[1] - 3) = 0.
        assert_eq!(out[0][2], 1.0);
        assert_eq!(out[0][4], 0.0);
    }

    #[test]
    fn cmn_mean_survives_utterances() {
        let mut ft = FeatureTransform::new(&cfg()).unwrap();
        let ceps: Vec<Vec<f32>> = (0..100).map(|_| vec![10.0, -4.0]).collect();
        run(&mut ft, &ceps);
        let mean_after = ft.cmn.as_ref().unwrap().mean.clone();
        assert!((mean_after[0] - 10.0).abs() < 1e-3);
        assert!((mean_after[1] + 4.0).abs() < 1e-3);
        // Second utterance now decodes against the learned mean from frame one.
        let mut out = Vec::new();
        ft.start_utt();
        ft.process_cep(vec![10.0, -4.0], &mut out);
        for _ in 0..6 {
            ft.process_cep(vec![10.0, -4.0], &mut out);
        }
        assert!(out[0][0].abs() < 1e-3);
    }

    #[test]
    fn chunking_is_invisible() {
        // The transform is frame-driven, so any upstream chunking yields identical output; this
        // guards the property at the feature level.
        let ceps: Vec<Vec<f32>> = (0..40)
            .map(|i| vec![(i as f32 * 0.37).sin(), (i as f32 * 0.11).cos()])
            .collect();
        let mut ft = FeatureTransform::new(&no_cmn_cfg()).unwrap();
        let whole = run(&mut ft, &ceps);
        let mut piecewise = Vec::new();
        ft.start_utt();
        for chunk in ceps.chunks(3) {
            for c in chunk {
                ft.process_cep(c.clone(), &mut piecewise);
            }
        }
        ft.end_utt(&mut piecewise);
        assert_eq!(whole.len(), piecewise.len());
        for (a, b) in whole.iter().zip(piecewise.iter()) {
            assert_eq!(a, b);
        }
    }
}
