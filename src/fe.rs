//! Acoustic front end: 16-bit PCM in, Mel-frequency cepstral coefficients out.
//!
//! Per frame: pre-emphasis against the previous sample, a Hamming window, a real FFT at the next
//! power of two, triangular Mel filters over the power spectrum, a log floor, and a DCT-II down
//! to `ncep` coefficients (with optional sinusoidal liftering). Frames overlap; the tail that
//! hasn't yet filled a whole window is carried across `process` calls so feeding the same samples
//! in any chunking produces the same frames.
//!
//! The Mel filter bounds come from a preset keyed by the nearest supported sample rate, so a
//! 44.0kHz stream quietly gets the 44.1kHz filterbank while framing still honors the true rate.
use crate::config::{Config, DctKind};
use crate::error::{Error, Result};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Floor applied to filterbank energies before the log. Keeps silence from collapsing to -inf.
const MEL_FLOOR: f32 = 1e-5;

fn mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_inv(m: f32) -> f32 {
    700.0 * (10f32.powf(m / 2595.0) - 1.0)
}

/// One triangular filter: first FFT bin it covers plus the per-bin weights.
#[derive(Debug, Clone)]
struct MelFilter {
    start_bin: usize,
    weights: Vec<f32>,
}

fn build_filterbank(
    nfilt: usize,
    fft_len: usize,
    sample_rate: f32,
    lowerf: f32,
    upperf: f32,
) -> Result<Vec<MelFilter>> {
    let nyquist = sample_rate / 2.0;
    if upperf > nyquist || lowerf >= upperf {
        return Err(Error::InvalidConfig(format!(
            "mel filter bounds {lowerf}..{upperf} invalid for nyquist {nyquist}"
        )));
    }
    let n_bins = fft_len / 2 + 1;
    let hz_per_bin = sample_rate / fft_len as f32;
    let mel_lo = mel(lowerf);
    let mel_hi = mel(upperf);
    let mel_step = (mel_hi - mel_lo) / (nfilt + 1) as f32;

    let mut filters = Vec::with_capacity(nfilt);
    for i in 0..nfilt {
        let left = mel_inv(mel_lo + mel_step * i as f32);
        let center = mel_inv(mel_lo + mel_step * (i + 1) as f32);
        let right = mel_inv(mel_lo + mel_step * (i + 2) as f32);
        let mut start_bin = None;
        let mut weights = Vec::new();
        for b in 0..n_bins {
            let hz = b as f32 * hz_per_bin;
            let w = if hz <= left || hz >= right {
                0.0
            } else if hz <= center {
                (hz - left) / (center - left)
            } else {
                (right - hz) / (right - center)
            };
            if w > 0.0 {
                if start_bin.is_none() {
                    start_bin = Some(b);
                }
                weights.push(w);
            } else if start_bin.is_some() {
                break;
            }
        }
        // A filter narrower than one bin can happen with tiny FFTs; give it its center bin so
        // every filter reads something.
        let start_bin = match start_bin {
            Some(b) => b,
            None => {
                weights.push(1.0);
                (center / hz_per_bin).round() as usize
            }
        };
        filters.push(MelFilter { start_bin, weights });
    }
    Ok(filters)
}

pub struct FrontEnd {
    frame_len: usize,
    frame_shift: usize,
    ncep: usize,
    nfilt: usize,
    alpha: f32,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    fft_len: usize,
    filters: Vec<MelFilter>,
    dct: Vec<f32>,
    lifter: Vec<f32>,

    // Per-utterance streaming state.
    pending: Vec<i16>,
    prior: i16,
    new_samples: usize,
    // Scratch buffers so the per-frame path never allocates.
    spec: Vec<Complex<f32>>,
    mels: Vec<f32>,
}

impl FrontEnd {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let frame_len = config.frame_len();
        let frame_shift = config.frame_shift();
        let fft_len = frame_len.next_power_of_two();

        let mapped = config.mapped_rate() as f32;
        let lowerf = config.lowerf.unwrap_or(133.33334);
        let upperf = config.upperf.unwrap_or_else(|| (mapped / 2.0) - 100.0);
        let filters = build_filterbank(
            config.nfilt,
            fft_len,
            config.samprate as f32,
            lowerf,
            upperf.min(config.samprate as f32 / 2.0),
        )?;

        let window = (0..frame_len)
            .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f32 / (frame_len - 1) as f32).cos())
            .collect();

        // DCT-II basis, ncep x nfilt.
        let n = config.nfilt as f32;
        let mut dct = Vec::with_capacity(config.ncep * config.nfilt);
        for k in 0..config.ncep {
            let scale = match config.transform {
                DctKind::Dct if k == 0 => (1.0 / n).sqrt(),
                _ => (2.0 / n).sqrt(),
            };
            for j in 0..config.nfilt {
                dct.push(scale * (PI * k as f32 * (2.0 * j as f32 + 1.0) / (2.0 * n)).cos());
            }
        }

        let lifter = if config.lifter > 0 {
            let l = config.lifter as f32;
            (0..config.ncep)
                .map(|k| 1.0 + (l / 2.0) * (PI * k as f32 / l).sin())
                .collect()
        } else {
            vec![1.0; config.ncep]
        };

        let fft = FftPlanner::new().plan_fft_forward(fft_len);
        Ok(Self {
            frame_len,
            frame_shift,
            ncep: config.ncep,
            nfilt: config.nfilt,
            alpha: config.alpha,
            window,
            fft,
            fft_len,
            filters,
            dct,
            lifter,
            pending: Vec::with_capacity(frame_len),
            prior: 0,
            new_samples: 0,
            spec: vec![Complex::default(); fft_len],
            mels: vec![0.0; config.nfilt],
        })
    }

    pub fn output_size(&self) -> usize {
        self.ncep
    }

    pub fn frame_shift(&self) -> usize {
        self.frame_shift
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn start_utt(&mut self) {
        self.pending.clear();
        self.prior = 0;
        self.new_samples = 0;
    }

    /// Feed PCM, appending up to `max_frames` cepstral frames to `out`. Returns
    /// `(samples_consumed, frames_produced)`; unconsumed samples stay with the caller, a partial
    /// window's worth of consumed ones are carried internally for the next call.
    pub fn process(
        &mut self,
        pcm: &[i16],
        out: &mut Vec<Vec<f32>>,
        max_frames: usize,
    ) -> (usize, usize) {
        let mut consumed = 0;
        let mut produced = 0;
        while produced < max_frames {
            let needed = self.frame_len.saturating_sub(self.pending.len());
            let take = needed.min(pcm.len() - consumed);
            self.pending.extend_from_slice(&pcm[consumed..consumed + take]);
            self.new_samples += take;
            consumed += take;
            if self.pending.len() < self.frame_len {
                break;
            }
            let cep = self.compute_frame(None);
            out.push(cep);
            produced += 1;
            self.advance();
        }
        (consumed, produced)
    }

    /// Flush at utterance end. Emits one zero-padded frame iff samples not yet covered by any
    /// emitted frame remain, and resets the streaming state.
    pub fn end_utt(&mut self, out: &mut Vec<Vec<f32>>) -> usize {
        let n = if self.new_samples > 0 && !self.pending.is_empty() {
            let pad = self.frame_len - self.pending.len();
            let cep = self.compute_frame(Some(pad));
            out.push(cep);
            1
        } else {
            0
        };
        self.start_utt();
        n
    }

    fn advance(&mut self) {
        self.prior = self.pending[self.frame_shift - 1];
        self.pending.drain(..self.frame_shift);
        self.new_samples = self.new_samples.saturating_sub(self.frame_shift);
    }

    fn compute_frame(&mut self, zero_pad: Option<usize>) -> Vec<f32> {
        let n = match zero_pad {
            Some(pad) => self.frame_len - pad,
            None => self.frame_len,
        };
        // Pre-emphasis and windowing straight into the FFT buffer.
        self.spec.iter_mut().for_each(|c| *c = Complex::default());
        let mut prev = self.prior as f32;
        for i in 0..n {
            let s = self.pending[i] as f32;
            self.spec[i] = Complex::new((s - self.alpha * prev) * self.window[i], 0.0);
            prev = s;
        }
        self.fft.process(&mut self.spec);

        // Power spectrum through the triangular filters.
        for (f, out) in self.filters.iter().zip(self.mels.iter_mut()) {
            let mut acc = 0.0;
            for (i, w) in f.weights.iter().enumerate() {
                let c = self.spec[f.start_bin + i];
                acc += w * (c.re * c.re + c.im * c.im);
            }
            *out = acc.max(MEL_FLOOR).ln();
        }

        // DCT-II and lifter.
        let mut cep = Vec::with_capacity(self.ncep);
        for k in 0..self.ncep {
            let row = &self.dct[k * self.nfilt..(k + 1) * self.nfilt];
            let c: f32 = row.iter().zip(self.mels.iter()).map(|(d, m)| d * m).sum();
            cep.push(c * self.lifter[k]);
        }
        cep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fe(samprate: u32) -> FrontEnd {
        let mut c = Config::default();
        c.samprate = samprate;
        FrontEnd::new(&c).unwrap()
    }

    fn tone(rate: u32, hz: f32, n: usize) -> Vec<i16> {
        (0..n)
            .map(|i| {
                let t = i as f32 / rate as f32;
                ((2.0 * PI * hz * t).sin() * 8000.0) as i16
            })
            .collect()
    }

    #[test]
    fn frame_counts_match_geometry() {
        let mut fe = fe(16000);
        let pcm = tone(16000, 440.0, 16000); // one second
        let mut cep = Vec::new();
        fe.start_utt();
        let (consumed, produced) = fe.process(&pcm, &mut cep, usize::MAX);
        // 410-sample window, 160 shift: floor((16000 - 410) / 160) + 1 frames.
        assert_eq!(produced, 98);
        assert!(consumed <= pcm.len());
        fe.end_utt(&mut cep);
        assert!(cep.len() == 98 || cep.len() == 99);
        assert!(cep.iter().all(|c| c.len() == 13));
    }

    #[test]
    fn chunked_equals_single_call() {
        let pcm = tone(16000, 313.0, 7000);
        let mut one = Vec::new();
        let mut fe1 = fe(16000);
        fe1.start_utt();
        fe1.process(&pcm, &mut one, usize::MAX);
        fe1.end_utt(&mut one);

        let mut many = Vec::new();
        let mut fe2 = fe(16000);
        fe2.start_utt();
        let mut off = 0;
        for chunk in [1usize, 7, 100, 159, 160, 161, 2048, 4000, 10000] {
            let end = (off + chunk).min(pcm.len());
            let mut rest = &pcm[off..end];
            while !rest.is_empty() {
                let (used, _) = fe2.process(rest, &mut many, usize::MAX);
                rest = &rest[used..];
            }
            off = end;
            if off == pcm.len() {
                break;
            }
        }
        fe2.end_utt(&mut many);

        assert_eq!(one.len(), many.len());
        for (a, b) in one.iter().zip(many.iter()) {
            assert_eq!(a, b, "chunked output must be bit-identical");
        }
    }

    #[test]
    fn max_frames_caps_consumption() {
        let pcm = tone(16000, 200.0, 8000);
        let mut cep = Vec::new();
        let mut fe = fe(16000);
        fe.start_utt();
        let (consumed, produced) = fe.process(&pcm, &mut cep, 3);
        assert_eq!(produced, 3);
        assert!(consumed < pcm.len());
        // The remainder still decodes to the same total.
        let (_, more) = fe.process(&pcm[consumed..], &mut cep, usize::MAX);
        assert_eq!(3 + more, 48);
    }

    #[test]
    fn short_input_never_overproduces() {
        // Property from the spec: at most floor(samples / shift) + 1 frames, and zero-length
        // input must not crash.
        for n in [0usize, 1, 159, 160, 410, 411, 819, 820] {
            let pcm = tone(16000, 100.0, n);
            let mut cep = Vec::new();
            let mut fe = fe(16000);
            fe.start_utt();
            fe.process(&pcm, &mut cep, usize::MAX);
            fe.end_utt(&mut cep);
            assert!(
                cep.len() <= n / 160 + 1,
                "{n} samples gave {} frames",
                cep.len()
            );
            if n == 0 {
                assert!(cep.is_empty());
            }
        }
    }

    #[test]
    fn tone_puts_energy_in_low_cepstra() {
        let mut fe = fe(8000);
        let pcm = tone(8000, 300.0, 4000);
        let mut cep = Vec::new();
        fe.start_utt();
        fe.process(&pcm, &mut cep, usize::MAX);
        assert!(!cep.is_empty());
        // C0 tracks overall log energy; a loud tone should sit well above the mel floor.
        assert!(cep[5][0] > 0.0);
    }

    #[test]
    fn unsupported_rate_fails() {
        let mut c = Config::default();
        c.samprate = 0;
        assert!(FrontEnd::new(&c).is_err());
    }
}
