//! The acoustic model: everything between raw PCM and a vector of senone scores.
//!
//! `Acmod` owns the front end, the feature transform and the Gaussian scorer, plus the two
//! pieces of per-utterance state the search leans on: the retained feature buffer (frames are
//! kept for the whole utterance so a second alignment pass can rescore them) and the per-frame
//! score normalization offsets. The search talks to it in two steps per frame: declare the
//! senones it cares about, then ask for the score vector.
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fe::FrontEnd;
use crate::feat::FeatureTransform;
use crate::logmath::{LogMath, WORST_SCORE};
use ndarray::Array1;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub mod mdef;
pub mod mgau;
pub mod tmat;

pub use mdef::Mdef;
pub use mgau::PtmMgau;
pub use tmat::Tmat;

/// Set of senone ids active for a frame.
#[derive(Debug, Clone)]
pub struct SenoneSet {
    bits: Vec<u64>,
    n: usize,
}

impl SenoneSet {
    pub fn new(n: usize) -> Self {
        Self {
            bits: vec![0; (n + 63) / 64],
            n,
        }
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    #[inline]
    pub fn insert(&mut self, sen: u16) {
        debug_assert!((sen as usize) < self.n);
        self.bits[sen as usize / 64] |= 1 << (sen as usize % 64);
    }

    #[inline]
    pub fn contains(&self, sen: u16) -> bool {
        self.bits[sen as usize / 64] & (1 << (sen as usize % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }
}

pub struct Acmod {
    pub mdef: Arc<Mdef>,
    pub tmat: Arc<Tmat>,
    pub lmath: Arc<LogMath>,
    mgau: PtmMgau,
    fe: FrontEnd,
    feat: FeatureTransform,

    /// Features for the whole current utterance; the aligner rescored them after the fact.
    feats: Vec<Array1<f32>>,
    /// Per scored frame, the normalization offset that was subtracted so the frame's best
    /// senone reads zero.
    senscale: Vec<i32>,
    scores: Vec<i32>,
    active: SenoneSet,
    compallsen: bool,
    /// Frame whose scores currently sit in `scores`, or -1.
    scored_frame: i32,
}

impl Acmod {
    /// Load the full acoustic model from a directory laid out the standard way: `mdef`,
    /// `means`, `variances`, `mixture_weights` or `sendump`, `transition_matrices` and
    /// `feat.params`.
    pub fn load(dir: &Path, config: &mut Config, lmath: Arc<LogMath>) -> Result<Self> {
        let feat_params = dir.join("feat.params");
        if feat_params.exists() {
            config.load_feat_params(&feat_params)?;
        }
        config.validate()?;

        let mdef = Arc::new(Mdef::load(dir.join("mdef"))?);
        let tmat = Arc::new(Tmat::load(
            dir.join("transition_matrices"),
            &lmath,
            config.tmatfloor,
        )?);
        if tmat.n_tmat() != mdef.n_tmat() {
            return Err(Error::model(
                dir.join("transition_matrices"),
                format!(
                    "{} matrices but the model definition wants {}",
                    tmat.n_tmat(),
                    mdef.n_tmat()
                ),
            ));
        }
        if tmat.n_state() != mdef.n_emit_state() {
            return Err(Error::model(
                dir.join("transition_matrices"),
                "state count disagrees with the model definition",
            ));
        }

        let sendump_path = dir.join("sendump");
        let (mixw_path, sendump) = if sendump_path.exists() {
            (sendump_path, true)
        } else {
            (dir.join("mixture_weights"), false)
        };
        let mgau = PtmMgau::load(
            &dir.join("means"),
            &dir.join("variances"),
            &mixw_path,
            sendump,
            &mdef,
            &lmath,
            config.varfloor,
            config.mixwfloor,
            config.topn,
            config.ds,
        )?;

        let fe = FrontEnd::new(config)?;
        let feat = FeatureTransform::new(config)?;
        if feat.output_size() != mgau.veclen() {
            return Err(Error::model(
                dir.to_path_buf(),
                format!(
                    "feature dimension {} does not match gaussian dimension {}",
                    feat.output_size(),
                    mgau.veclen()
                ),
            ));
        }

        info!(model = %dir.display(), "acoustic model ready");
        Ok(Self::from_parts(mdef, tmat, lmath, mgau, fe, feat, config))
    }

    /// Assemble from already-built parts. Tests use this with synthetic models.
    pub fn from_parts(
        mdef: Arc<Mdef>,
        tmat: Arc<Tmat>,
        lmath: Arc<LogMath>,
        mgau: PtmMgau,
        fe: FrontEnd,
        feat: FeatureTransform,
        config: &Config,
    ) -> Self {
        let n_sen = mdef.n_sen();
        Self {
            mdef,
            tmat,
            lmath,
            mgau,
            fe,
            feat,
            feats: Vec::new(),
            senscale: Vec::new(),
            scores: vec![WORST_SCORE; n_sen],
            active: SenoneSet::new(n_sen),
            compallsen: config.compallsen,
            scored_frame: -1,
        }
    }

    pub fn n_sen(&self) -> usize {
        self.mdef.n_sen()
    }

    pub fn start_utt(&mut self) {
        self.fe.start_utt();
        self.feat.start_utt();
        self.mgau.start_utt();
        self.feats.clear();
        self.senscale.clear();
        self.active.clear();
        self.scored_frame = -1;
    }

    /// Feed PCM; returns the number of feature frames now available in total.
    pub fn process_raw(&mut self, pcm: &[i16]) -> usize {
        let mut cep = Vec::new();
        let mut rest = pcm;
        while !rest.is_empty() {
            let (used, _) = self.fe.process(rest, &mut cep, usize::MAX);
            if used == 0 {
                break;
            }
            rest = &rest[used..];
        }
        for c in cep {
            self.feat.process_cep(c, &mut self.feats);
        }
        self.feats.len()
    }

    /// Raw little/big-endian byte entry point, for callers that read files without decoding.
    pub fn process_bytes(&mut self, bytes: &[u8], big_endian: bool) -> usize {
        let pcm: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| {
                let b: [u8; 2] = b.try_into().unwrap();
                if big_endian {
                    i16::from_be_bytes(b)
                } else {
                    i16::from_le_bytes(b)
                }
            })
            .collect();
        self.process_raw(&pcm)
    }

    /// Drain the front end and feature transform: the zero-padded tail frame and the delta
    /// window's replicated right edge come out now. Safe to call again later; a drained
    /// pipeline yields nothing. Returns total frames.
    pub fn flush(&mut self) -> usize {
        let mut cep = Vec::new();
        self.fe.end_utt(&mut cep);
        for c in cep {
            self.feat.process_cep(c, &mut self.feats);
        }
        self.feat.end_utt(&mut self.feats);
        self.feats.len()
    }

    /// Flush the front end and feature transform at utterance end; returns total frames.
    pub fn end_utt(&mut self) -> usize {
        let n = self.flush();
        debug!(
            frames = n,
            sen_evals = self.mgau.n_sen_eval,
            gau_evals = self.mgau.n_gau_eval,
            "utterance front end flushed"
        );
        n
    }

    pub fn n_frames(&self) -> usize {
        self.feats.len()
    }

    pub fn feature(&self, frame: i32) -> &Array1<f32> {
        &self.feats[frame as usize]
    }

    pub fn clear_active(&mut self) {
        self.active.clear();
    }

    pub fn activate(&mut self, sen: u16) {
        self.active.insert(sen);
    }

    /// Score the declared active senones for `frame`. Scores are normalized so the frame best
    /// is zero; the shift is recorded in `senscale` so utterance scores can be reconstructed.
    pub fn score_frame(&mut self, frame: i32) -> &[i32] {
        assert!((frame as usize) < self.feats.len(), "frame {frame} not yet computed");
        if frame == self.scored_frame {
            return &self.scores;
        }
        let feat = &self.feats[frame as usize];
        let active = if self.compallsen {
            None
        } else {
            Some(&self.active)
        };
        let best = self.mgau.frame_eval(feat, active, frame, &mut self.scores);
        if best > WORST_SCORE {
            for s in self.scores.iter_mut() {
                if *s > WORST_SCORE {
                    *s -= best;
                }
            }
        }
        debug_assert_eq!(self.senscale.len(), frame as usize);
        self.senscale.push(if best > WORST_SCORE { best } else { 0 });
        self.scored_frame = frame;
        &self.scores
    }

    /// Sum of normalization shifts over `frames`; add this back to a normalized path score to
    /// recover the true acoustic score.
    pub fn senscale_sum(&self, start: i32, end: i32) -> i32 {
        self.senscale[start as usize..=(end as usize).min(self.senscale.len() - 1)]
            .iter()
            .sum()
    }

    /// Rewind scoring so a second search pass (forced alignment) can rescore the retained
    /// features from frame zero.
    pub fn rewind(&mut self) {
        self.senscale.clear();
        self.scored_frame = -1;
        self.mgau.start_utt();
        self.active.clear();
    }

    /// Inject a precomputed feature frame, bypassing the DSP front end. Pipeline tests use
    /// this to decode hand-built feature sequences deterministically.
    #[cfg(test)]
    pub(crate) fn push_feature(&mut self, feat: Array1<f32>) {
        self.feats.push(feat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn senone_set_basics() {
        let mut s = SenoneSet::new(130);
        assert!(s.is_empty());
        s.insert(0);
        s.insert(64);
        s.insert(129);
        assert!(s.contains(0) && s.contains(64) && s.contains(129));
        assert!(!s.contains(1) && !s.contains(63));
        assert_eq!(s.len(), 3);
        s.clear();
        assert!(s.is_empty());
    }
}
