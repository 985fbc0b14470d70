//! Decoder configuration. One flat struct with every recognized key, serde-derived so a config
//! can come straight out of JSON, and a `Default` carrying the stock values. Model directories
//! ship a `feat.params` file of `-key value` overrides for the front end; those are folded in
//! before validation so a model always decodes with the parameters it was trained with.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Sample rates we have Mel filterbank presets for. Anything else maps to the nearest member for
/// the filter bounds (framing still uses the true rate).
pub const SUPPORTED_RATES: [u32; 7] = [8000, 11025, 16000, 22050, 32000, 44100, 48000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DctKind {
    /// Orthonormal DCT-II.
    Dct,
    /// HTK-style scaling (every coefficient gets the same factor, including C0).
    Htk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmnKind {
    Live,
    Batch,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
}

/// Which grammar source the config selects. At most one may be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarSource {
    FsgFile(PathBuf),
    JsgfFile(PathBuf),
    KwsFile(PathBuf),
    Keyphrase(String),
    AlignText(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Acoustic model directory: `mdef`, `means`, `variances`, `mixture_weights` or `sendump`,
    /// `transition_matrices`, `feat.params`.
    pub hmm: Option<PathBuf>,
    pub dict: Option<PathBuf>,
    pub fdict: Option<PathBuf>,

    // Grammar sources, mutually exclusive.
    pub fsg: Option<PathBuf>,
    pub jsgf: Option<PathBuf>,
    pub kws: Option<PathBuf>,
    pub keyphrase: Option<String>,
    pub align: Option<String>,
    /// Fully qualified top rule name for JSGF grammars; defaults to the first public rule.
    pub toprule: Option<String>,

    // Front end.
    pub samprate: u32,
    pub frate: u32,
    pub nfilt: usize,
    pub ncep: usize,
    pub wlen: f32,
    pub alpha: f32,
    pub transform: DctKind,
    pub lifter: usize,
    pub lowerf: Option<f32>,
    pub upperf: Option<f32>,
    pub input_endian: Endian,

    // Features.
    pub feat: String,
    pub cmn: CmnKind,
    pub cmninit: String,
    pub varnorm: bool,
    pub agc: String,
    pub lda: Option<PathBuf>,
    pub ldadim: usize,

    // Scorer.
    pub topn: usize,
    pub ds: usize,
    pub compallsen: bool,
    pub logbase: f64,
    pub varfloor: f64,
    pub mixwfloor: f64,
    pub tmatfloor: f64,

    // Search.
    pub beam: f64,
    pub pbeam: f64,
    pub wbeam: f64,
    pub lw: f32,
    pub wip: f64,
    pub pip: f64,
    pub bestpath: bool,
    pub maxhmmpf: i32,
    pub maxwpf: i32,
    pub ascale: f32,

    // Logging.
    pub logfn: Option<PathBuf>,
    pub loglevel: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hmm: None,
            dict: None,
            fdict: None,
            fsg: None,
            jsgf: None,
            kws: None,
            keyphrase: None,
            align: None,
            toprule: None,
            samprate: 16000,
            frate: 100,
            nfilt: 40,
            ncep: 13,
            wlen: 0.025625,
            alpha: 0.97,
            transform: DctKind::Dct,
            lifter: 0,
            lowerf: None,
            upperf: None,
            input_endian: Endian::Little,
            feat: "1s_c_d_dd".into(),
            cmn: CmnKind::Live,
            cmninit: "40,3,-1".into(),
            varnorm: false,
            agc: "none".into(),
            lda: None,
            ldadim: 0,
            topn: 4,
            ds: 1,
            compallsen: false,
            logbase: 1.0001,
            varfloor: 1e-4,
            mixwfloor: 1e-7,
            tmatfloor: 1e-4,
            beam: 1e-48,
            pbeam: 1e-48,
            wbeam: 7e-29,
            lw: 6.5,
            wip: 0.65,
            pip: 1.0,
            bestpath: true,
            maxhmmpf: 30000,
            maxwpf: -1,
            ascale: 20.0,
            logfn: None,
            loglevel: None,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Frame shift and length in samples at the configured rate.
    pub fn frame_shift(&self) -> usize {
        (self.samprate / self.frate) as usize
    }

    pub fn frame_len(&self) -> usize {
        (self.wlen * self.samprate as f32).round() as usize
    }

    /// The supported rate whose filterbank preset we use for this configuration.
    pub fn mapped_rate(&self) -> u32 {
        SUPPORTED_RATES
            .iter()
            .copied()
            .min_by_key(|r| r.abs_diff(self.samprate))
            .unwrap()
    }

    pub fn grammar_source(&self) -> Result<Option<GrammarSource>> {
        let mut sources = Vec::new();
        if let Some(p) = &self.fsg {
            sources.push(GrammarSource::FsgFile(p.clone()));
        }
        if let Some(p) = &self.jsgf {
            sources.push(GrammarSource::JsgfFile(p.clone()));
        }
        if let Some(p) = &self.kws {
            sources.push(GrammarSource::KwsFile(p.clone()));
        }
        if let Some(p) = &self.keyphrase {
            sources.push(GrammarSource::Keyphrase(p.clone()));
        }
        if let Some(t) = &self.align {
            sources.push(GrammarSource::AlignText(t.clone()));
        }
        if sources.len() > 1 {
            return Err(Error::InvalidConfig(
                "fsg, jsgf, kws, keyphrase and align are mutually exclusive".into(),
            ));
        }
        Ok(sources.pop())
    }

    pub fn validate(&self) -> Result<()> {
        if self.samprate == 0 {
            return Err(Error::InvalidConfig("samprate must be positive".into()));
        }
        if self.frate == 0 || self.frate > self.samprate {
            return Err(Error::InvalidConfig(format!(
                "frame rate {} invalid for sample rate {}",
                self.frate, self.samprate
            )));
        }
        if self.frame_len() < self.frame_shift() {
            return Err(Error::InvalidConfig(
                "window length shorter than frame shift".into(),
            ));
        }
        if self.ncep == 0 || self.ncep > self.nfilt {
            return Err(Error::InvalidConfig(format!(
                "ncep {} must be in 1..=nfilt ({})",
                self.ncep, self.nfilt
            )));
        }
        if self.feat != "1s_c_d_dd" {
            return Err(Error::InvalidConfig(format!(
                "unsupported feature type {:?}",
                self.feat
            )));
        }
        if self.agc != "none" {
            return Err(Error::InvalidConfig(format!(
                "unsupported agc type {:?}",
                self.agc
            )));
        }
        if !(self.beam > 0.0 && self.beam <= 1.0)
            || !(self.pbeam > 0.0 && self.pbeam <= 1.0)
            || !(self.wbeam > 0.0 && self.wbeam <= 1.0)
        {
            return Err(Error::InvalidConfig(
                "beams must be probabilities in (0, 1]".into(),
            ));
        }
        if self.topn == 0 || self.ds == 0 {
            return Err(Error::InvalidConfig("topn and ds must be nonzero".into()));
        }
        self.grammar_source().map(|_| ())
    }

    /// Parse the initial cepstral mean from the `cmninit` string ("40,3,-1"), padded with zeros
    /// out to `ncep` components.
    pub fn cmn_init_vec(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; self.ncep];
        for (i, tok) in self.cmninit.split(',').enumerate() {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            if i >= out.len() {
                break;
            }
            out[i] = tok
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("bad cmninit component {tok:?}")))?;
        }
        Ok(out)
    }

    /// Fold in a `feat.params` file from the model directory. Unknown keys get a warning rather
    /// than an error since model packages grow new ones over time.
    pub fn load_feat_params(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut toks = text.split_whitespace().peekable();
        while let Some(key) = toks.next() {
            let Some(key) = key.strip_prefix('-') else {
                return Err(Error::model(path, format!("expected -key, got {key:?}")));
            };
            let val = toks
                .next()
                .ok_or_else(|| Error::model(path, format!("missing value for -{key}")))?;
            self.apply_kv(key, val, path)?;
        }
        Ok(())
    }

    fn apply_kv(&mut self, key: &str, val: &str, path: &Path) -> Result<()> {
        let bad = |key: &str, val: &str| {
            Error::model(path, format!("bad value {val:?} for -{key}"))
        };
        match key {
            "samprate" => self.samprate = val.parse().map_err(|_| bad(key, val))?,
            "frate" => self.frate = val.parse().map_err(|_| bad(key, val))?,
            "nfilt" => self.nfilt = val.parse().map_err(|_| bad(key, val))?,
            "ncep" => self.ncep = val.parse().map_err(|_| bad(key, val))?,
            "wlen" => self.wlen = val.parse().map_err(|_| bad(key, val))?,
            "alpha" => self.alpha = val.parse().map_err(|_| bad(key, val))?,
            "lowerf" => self.lowerf = Some(val.parse().map_err(|_| bad(key, val))?),
            "upperf" => self.upperf = Some(val.parse().map_err(|_| bad(key, val))?),
            "lifter" => self.lifter = val.parse().map_err(|_| bad(key, val))?,
            "transform" => {
                self.transform = match val {
                    "dct" | "legacy" => DctKind::Dct,
                    "htk" => DctKind::Htk,
                    _ => return Err(bad(key, val)),
                }
            }
            "feat" => self.feat = val.to_string(),
            "agc" => self.agc = val.to_string(),
            "cmn" => {
                self.cmn = match val {
                    "live" | "current" | "prior" => CmnKind::Live,
                    "batch" => CmnKind::Batch,
                    "none" => CmnKind::None,
                    _ => return Err(bad(key, val)),
                }
            }
            "cmninit" => self.cmninit = val.to_string(),
            "varnorm" => self.varnorm = matches!(val, "yes" | "true" | "1"),
            "lda" => self.lda = Some(PathBuf::from(val)),
            "ldadim" => self.ldadim = val.parse().map_err(|_| bad(key, val))?,
            other => warn!("ignoring unknown feat.params key -{other} {val}"),
        }
        Ok(())
    }
}
