#![doc = include_str!("../README.md")]
use crate::acmod::Acmod;
use crate::align::Alignment;
use crate::config::{Config, Endian, GrammarSource};
use crate::dict::{Dict, WordId};
use crate::dict2pid::Dict2Pid;
use crate::error::{Error, Result};
use crate::fsg::model::{FsgBuilder, FsgModel};
use crate::fsg::{FsgSearch, Jsgf};
use crate::lattice::Lattice;
use crate::logmath::{LogMath, WORST_SCORE};
use crate::search::{AlignSearch, Search, SearchModule, Seg};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod acmod;
pub mod align;
pub mod config;
pub mod dict;
pub mod dict2pid;
pub mod error;
pub mod fe;
pub mod feat;
pub mod fsg;
pub mod hmm;
pub mod lattice;
pub mod logmath;
pub mod s3file;
pub mod search;

/// Utterance lifecycle. Operations that reshape the decoder (grammar, dictionary) are only
/// legal outside an active utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UttState {
    Idle,
    Started,
    Processing,
    Finished,
}

impl UttState {
    fn name(self) -> &'static str {
        match self {
            UttState::Idle => "idle",
            UttState::Started => "started",
            UttState::Processing => "processing",
            UttState::Finished => "finished",
        }
    }
}

pub struct Decoder {
    config: Config,
    lmath: Arc<LogMath>,
    acmod: Acmod,
    dict: Dict,
    d2p: Arc<Dict2Pid>,
    search: Option<Search>,
    state: UttState,
    alignment: Option<Alignment>,
    lattice: Option<Lattice>,
}

impl Decoder {
    /// Load everything the config names: acoustic model directory, dictionaries, and at most
    /// one grammar source.
    pub fn init(mut config: Config) -> Result<Self> {
        config.validate()?;
        let lmath = Arc::new(LogMath::new(config.logbase, 0)?);
        let hmm_dir = config
            .hmm
            .clone()
            .ok_or_else(|| Error::InvalidConfig("no acoustic model directory (hmm)".into()))?;
        let acmod = Acmod::load(&hmm_dir, &mut config, lmath.clone())?;
        let dict = Dict::load(
            acmod.mdef.clone(),
            config.dict.as_deref(),
            config.fdict.as_deref(),
        )?;
        let d2p = Arc::new(Dict2Pid::build(acmod.mdef.clone()));

        let mut dec = Self {
            config,
            lmath,
            acmod,
            dict,
            d2p,
            search: None,
            state: UttState::Idle,
            alignment: None,
            lattice: None,
        };
        match dec.config.grammar_source()? {
            Some(GrammarSource::FsgFile(p)) => {
                let fsg = FsgModel::parse_file(&p, dec.lmath.clone())?;
                dec.set_fsg(fsg)?;
            }
            Some(GrammarSource::JsgfFile(p)) => {
                let text = std::fs::read_to_string(&p)?;
                dec.set_jsgf(&text)?;
            }
            Some(GrammarSource::KwsFile(p)) => {
                let text = std::fs::read_to_string(&p)?;
                dec.set_kws(&text)?;
            }
            Some(GrammarSource::Keyphrase(phrase)) => dec.set_keyphrase(&phrase)?,
            Some(GrammarSource::AlignText(text)) => dec.set_align_text(&text)?,
            None => {}
        }
        info!("decoder initialized");
        Ok(dec)
    }

    fn check_idle(&self, op: &'static str) -> Result<()> {
        match self.state {
            UttState::Idle | UttState::Finished => Ok(()),
            s => Err(Error::BadState {
                op,
                state: s.name(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logmath(&self) -> &Arc<LogMath> {
        &self.lmath
    }

    pub fn dict(&self) -> &Dict {
        &self.dict
    }

    /// Replace the active grammar with an already-built FSG.
    pub fn set_fsg(&mut self, fsg: FsgModel) -> Result<()> {
        self.check_idle("set_fsg")?;
        let search = FsgSearch::new(
            Arc::new(fsg),
            &self.dict,
            &self.d2p,
            &self.config,
            &self.lmath,
            self.acmod.tmat.clone(),
        )?;
        self.search = Some(Search::Fsg(search));
        self.state = UttState::Idle;
        Ok(())
    }

    pub fn set_fsg_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let fsg = FsgModel::parse_file(path, self.lmath.clone())?;
        self.set_fsg(fsg)
    }

    /// Compile JSGF text and activate it; the configured `toprule` picks the entry rule.
    pub fn set_jsgf(&mut self, text: &str) -> Result<()> {
        self.check_idle("set_jsgf")?;
        let grammar = Jsgf::parse(text)?;
        let fsg = grammar.build_fsg(self.config.toprule.as_deref(), self.lmath.clone())?;
        self.set_fsg(fsg)
    }

    /// Keyword list: one phrase per line, an optional `/threshold/` suffix is accepted and
    /// ignored (thresholding is a detector concern; here every phrase is a grammar path).
    pub fn set_kws(&mut self, text: &str) -> Result<()> {
        self.check_idle("set_kws")?;
        let mut phrases = Vec::new();
        for line in text.lines() {
            let line = match line.find('/') {
                Some(i) => &line[..i],
                None => line,
            };
            let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if !words.is_empty() {
                phrases.push(words);
            }
        }
        if phrases.is_empty() {
            return Err(Error::parse(0, "empty keyword list"));
        }
        let mut b = FsgBuilder::new("kws", 2, 0, 1, self.lmath.clone());
        let prob = 1.0 / phrases.len() as f64;
        for words in &phrases {
            let mut cur = 0;
            for (i, w) in words.iter().enumerate() {
                let next = if i + 1 == words.len() { 1 } else { b.new_state() };
                let p = if i == 0 { prob } else { 1.0 };
                b.add_arc(cur, next, w, p);
                cur = next;
            }
        }
        b.add_arc(0, 0, "<sil>", 0.1);
        b.add_arc(1, 1, "<sil>", 0.1);
        self.set_fsg(b.build()?)
    }

    pub fn set_keyphrase(&mut self, phrase: &str) -> Result<()> {
        self.check_idle("set_keyphrase")?;
        let fsg = FsgModel::keyphrase(phrase, self.lmath.clone())?;
        self.set_fsg(fsg)
    }

    /// Force-align the given text: decoding runs under a linear grammar of its words with
    /// optional silences, and `alignment()` afterwards yields the phone/state segmentation.
    pub fn set_align_text(&mut self, text: &str) -> Result<()> {
        self.check_idle("set_align_text")?;
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Err(Error::parse(0, "empty alignment text"));
        }
        for w in &words {
            if self.dict.wordid(w).is_none() {
                return Err(Error::parse(
                    0,
                    format!("alignment word {w:?} not in dictionary"),
                ));
            }
        }
        let fsg = FsgModel::align_text(&words, self.lmath.clone())?;
        let search = FsgSearch::new(
            Arc::new(fsg),
            &self.dict,
            &self.d2p,
            &self.config,
            &self.lmath,
            self.acmod.tmat.clone(),
        )?;
        self.search = Some(Search::Align(AlignSearch::new(search, text.to_string())));
        self.state = UttState::Idle;
        Ok(())
    }

    /// Add a word to the dictionary. With `update` the active search is rebuilt so the word is
    /// usable immediately.
    pub fn add_word(&mut self, word: &str, phones: &str, update: bool) -> Result<WordId> {
        self.check_idle("add_word")?;
        let phone_list: Vec<&str> = phones.split_whitespace().collect();
        let wid = self.dict.add_word_str(word, &phone_list, false)?;
        if update {
            self.rebuild_search()?;
        }
        Ok(wid)
    }

    /// Reload the dictionary and/or grammar, rebuilding the compiled search.
    pub fn reinit(&mut self, dict: Option<&Path>, fsg: Option<FsgModel>) -> Result<()> {
        self.check_idle("reinit")?;
        if let Some(path) = dict {
            self.dict = Dict::load(
                self.acmod.mdef.clone(),
                Some(path),
                self.config.fdict.as_deref(),
            )?;
        }
        match fsg {
            Some(f) => self.set_fsg(f),
            None => self.rebuild_search(),
        }
    }

    fn rebuild_search(&mut self) -> Result<()> {
        let Some(old) = self.search.take() else {
            return Ok(());
        };
        match old {
            Search::Fsg(s) => {
                let fsg = s.fsg.clone();
                let search = FsgSearch::new(
                    fsg,
                    &self.dict,
                    &self.d2p,
                    &self.config,
                    &self.lmath,
                    self.acmod.tmat.clone(),
                )?;
                self.search = Some(Search::Fsg(search));
            }
            Search::Align(s) => {
                let text = s.text.clone();
                self.set_align_text(&text)?;
            }
        }
        Ok(())
    }

    pub fn start_utt(&mut self) -> Result<()> {
        self.check_idle("start_utt")?;
        if self.search.is_none() {
            return Err(Error::InvalidConfig("no grammar has been set".into()));
        }
        self.acmod.start_utt();
        self.alignment = None;
        self.lattice = None;
        if let Some(search) = &mut self.search {
            search.as_module().start();
        }
        self.state = UttState::Started;
        debug!("utterance started");
        Ok(())
    }

    /// Feed PCM samples. Returns the number of feature frames available so far. `no_search`
    /// buffers audio without running the search (it catches up at `end_utt`). `full_utt`
    /// declares this chunk completes the utterance's audio: the front end's zero-padded tail
    /// frame and the delta window drain immediately instead of waiting for `end_utt`.
    ///
    /// Fails with `OutOfBeam` if every active path dies mid-utterance; the utterance can still
    /// be closed with `end_utt`, yielding the empty hypothesis.
    pub fn process_raw(
        &mut self,
        pcm: &[i16],
        no_search: bool,
        full_utt: bool,
    ) -> Result<usize> {
        match self.state {
            UttState::Started | UttState::Processing => {}
            s => {
                return Err(Error::BadState {
                    op: "process_raw",
                    state: s.name(),
                })
            }
        }
        self.state = UttState::Processing;
        let mut n = self.acmod.process_raw(pcm);
        if full_utt {
            n = self.acmod.flush();
        }
        if !no_search {
            self.catch_up(n)?;
        }
        Ok(n)
    }

    /// Raw byte entry point honoring the configured input endianness.
    pub fn process_bytes(&mut self, bytes: &[u8], no_search: bool, full_utt: bool) -> Result<usize> {
        match self.state {
            UttState::Started | UttState::Processing => {}
            s => {
                return Err(Error::BadState {
                    op: "process_bytes",
                    state: s.name(),
                })
            }
        }
        self.state = UttState::Processing;
        let big = self.config.input_endian == Endian::Big;
        let mut n = self.acmod.process_bytes(bytes, big);
        if full_utt {
            n = self.acmod.flush();
        }
        if !no_search {
            self.catch_up(n)?;
        }
        Ok(n)
    }

    fn catch_up(&mut self, n_frames: usize) -> Result<()> {
        if let Some(search) = &mut self.search {
            let m = search.as_module();
            while (m.n_frames() as usize) < n_frames {
                let f = m.n_frames();
                m.step(&mut self.acmod, f);
                if m.n_active() == 0 {
                    return Err(Error::OutOfBeam { frame: f });
                }
            }
        }
        Ok(())
    }

    /// Close the utterance: flush the front end, run the search over any remaining frames, and
    /// settle the backtrace. A forced alignment that cannot reach its text fails here with
    /// `AlignmentFailed` (after one widened retry).
    pub fn end_utt(&mut self) -> Result<()> {
        match self.state {
            UttState::Started | UttState::Processing => {}
            s => {
                return Err(Error::BadState {
                    op: "end_utt",
                    state: s.name(),
                })
            }
        }
        let n = self.acmod.end_utt();
        // Starvation at this point is not an error: the utterance is over and "nothing
        // survived" is reported as the empty hypothesis.
        if let Err(Error::OutOfBeam { frame }) = self.catch_up(n) {
            warn!(frame, "all paths out of beam, hypothesis will be empty");
        }
        self.state = UttState::Finished;
        let result = match &mut self.search {
            Some(search) => search.as_module().finish(&mut self.acmod),
            None => Ok(()),
        };
        if self.config.bestpath {
            if let Some(search) = &self.search {
                if let Some(mut lat) = search.as_module_ref().lattice(&self.dict) {
                    lat.posterior(&self.lmath, self.config.ascale);
                    self.lattice = Some(lat);
                }
            }
        }
        debug!(frames = n, "utterance ended");
        result
    }

    /// Best hypothesis: real words only, with the Viterbi path score. Empty string and
    /// `WORST_SCORE` mean nothing survived, which is a valid outcome.
    pub fn get_hyp(&self) -> (String, i32) {
        match (&self.search, self.state) {
            (Some(search), UttState::Finished) => search.as_module_ref().hyp(&self.dict),
            _ => (String::new(), WORST_SCORE),
        }
    }

    /// Log posterior probability of the best path, 0 when `bestpath` is off or nothing decoded.
    pub fn get_prob(&self) -> i32 {
        self.lattice.as_ref().map_or(0, |l| l.best_posterior())
    }

    /// Word segmentation of the best path (fillers included).
    pub fn seg_iter(&self) -> impl Iterator<Item = Seg> + '_ {
        let segs = match (&self.search, self.state) {
            (Some(search), UttState::Finished) => search.as_module_ref().segments(&self.dict),
            _ => Vec::new(),
        };
        segs.into_iter()
    }

    /// The word lattice of the finished utterance, if `bestpath` was enabled.
    pub fn lattice(&self) -> Option<&Lattice> {
        self.lattice.as_ref()
    }

    /// Three-level (word / phone / state) alignment of the finished utterance. After a forced
    /// alignment this is the aligned text; after an ordinary decode the hypothesis words are
    /// re-aligned against the retained features (the second pass).
    pub fn alignment(&mut self) -> Result<&Alignment> {
        if self.state != UttState::Finished {
            return Err(Error::BadState {
                op: "alignment",
                state: self.state.name(),
            });
        }
        if self.alignment.is_none() {
            let segs: Vec<Seg> = match &self.search {
                Some(search) => search.as_module_ref().segments(&self.dict),
                None => Vec::new(),
            };
            if segs.is_empty() {
                let (hyp, _) = self.get_hyp();
                return Err(Error::AlignmentFailed { text: hyp });
            }
            let al = align::align_utterance(&segs, &self.dict, &self.d2p, &mut self.acmod)?;
            self.alignment = Some(al);
        }
        Ok(self.alignment.as_ref().unwrap())
    }

    pub fn n_frames(&self) -> usize {
        self.acmod.n_frames()
    }

    pub fn state(&self) -> UttState {
        self.state
    }
}

/// Convenience function to setup logging for any binaries built on the library. Sets the
/// library and binaries to `info` logging by default, `RUST_LOG` overrides.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("xd_stt=info,decode=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::logmath::WORST_SCORE;

    fn align_decoder(text: &str) -> Decoder {
        let mut dec = toy_decoder();
        dec.set_align_text(text).unwrap();
        dec
    }

    fn decode_spans(dec: &mut Decoder, spans: &[(usize, usize)]) {
        dec.start_utt().unwrap();
        // Inject features directly, then drive the search with an empty chunk so the state
        // machine still sees a processing phase.
        feed(&mut dec.acmod, spans);
        dec.process_raw(&[], false, false).unwrap();
        dec.end_utt().unwrap();
    }

    #[test]
    fn end_to_end_forced_alignment_decodes_text() {
        let mut dec = align_decoder("ab");
        decode_spans(&mut dec, &[(0, 6), (1, 6), (2, 6), (0, 6)]);
        let (hyp, score) = dec.get_hyp();
        assert_eq!(hyp, "ab");
        assert!(score > WORST_SCORE);

        let segs: Vec<Seg> = dec.seg_iter().collect();
        assert!(!segs.is_empty());
        // Segments tile the utterance contiguously from frame 0.
        let mut last_ef = -1;
        for seg in &segs {
            assert_eq!(seg.sf, last_ef + 1);
            assert!(seg.ef >= seg.sf);
            last_ef = seg.ef;
        }
        assert_eq!(last_ef as usize, dec.n_frames() - 1);
        assert!(segs.iter().any(|s| s.word == "ab"));
    }

    #[test]
    fn alignment_invariants_hold() {
        let mut dec = align_decoder("ab");
        decode_spans(&mut dec, &[(0, 5), (1, 7), (2, 7), (0, 5)]);
        assert_eq!(dec.get_hyp().0, "ab");
        let al = dec.alignment().unwrap();

        assert!(al.n_words() >= 1);
        assert!(al.n_phones() >= 2);
        assert!(al.n_states() >= al.n_phones());

        // Coverage: children tile each parent exactly, first child starts at parent start.
        for w in al.words() {
            let (wsf, wdur, _) = w.seg();
            let mut expect = wsf;
            let mut total = 0;
            for (i, p) in w.children().enumerate() {
                let (psf, pdur, _) = p.seg();
                if i == 0 {
                    assert_eq!(psf, wsf);
                }
                assert_eq!(psf, expect);
                expect = psf + pdur;
                total += pdur;

                let mut sexpect = psf;
                let mut stotal = 0;
                for (j, st) in p.children().enumerate() {
                    let (ssf, sdur, _) = st.seg();
                    if j == 0 {
                        assert_eq!(ssf, psf);
                    }
                    assert_eq!(ssf, sexpect);
                    sexpect = ssf + sdur;
                    stotal += sdur;
                }
                assert_eq!(stotal, pdur, "states fill phone");
            }
            assert_eq!(total, wdur, "phones fill word");
        }

        // The aligned word "ab" must expand to AX then B.
        let phones: Vec<String> = al
            .words()
            .find(|w| w.name() == "ab")
            .unwrap()
            .children()
            .map(|p| p.name())
            .collect();
        assert_eq!(phones, vec!["AX".to_string(), "B".to_string()]);

        // Second call reuses the cached alignment.
        let n_states = al.n_states();
        let al2 = dec.alignment().unwrap();
        assert_eq!(al2.n_states(), n_states);
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let mut dec = align_decoder("ab");
        assert!(matches!(
            dec.process_raw(&[0i16; 10], false, false),
            Err(Error::BadState { .. })
        ));
        assert!(matches!(dec.end_utt(), Err(Error::BadState { .. })));

        dec.start_utt().unwrap();
        feed(&mut dec.acmod, &[(0, 4), (1, 6), (2, 6)]);
        dec.process_raw(&[], false, false).unwrap();
        // Grammar changes are illegal mid-utterance.
        assert!(matches!(
            dec.set_align_text("a"),
            Err(Error::BadState { .. })
        ));
        assert!(matches!(
            dec.add_word("c", "B AX", false),
            Err(Error::BadState { .. })
        ));
        let _ = dec.end_utt();
        // After finish the decoder is reusable.
        assert!(dec.start_utt().is_ok());
        feed(&mut dec.acmod, &[(0, 4), (1, 6), (2, 6), (0, 4)]);
        dec.process_raw(&[], false, false).unwrap();
        dec.end_utt().unwrap();
    }

    #[test]
    fn add_word_and_decode_it() {
        let mut dec = toy_decoder();
        let wid = dec.add_word("abba", "AX B B AX", false).unwrap();
        assert_eq!(dec.dict.wordid("abba"), Some(wid));
        let mut b = FsgBuilder::new("g", 2, 0, 1, dec.lmath.clone());
        b.add_arc(0, 1, "abba", 1.0);
        dec.set_fsg(b.build().unwrap()).unwrap();

        dec.start_utt().unwrap();
        feed(&mut dec.acmod, &[(1, 5), (2, 5), (2, 5), (1, 5)]);
        dec.process_raw(&[], false, false).unwrap();
        dec.end_utt().unwrap();
        assert_eq!(dec.get_hyp().0, "abba");
    }

    #[test]
    fn no_search_defers_to_end_utt() {
        let mut dec = align_decoder("ab");
        dec.start_utt().unwrap();
        feed(&mut dec.acmod, &[(0, 5), (1, 6), (2, 6), (0, 5)]);
        dec.process_raw(&[], true, false).unwrap();
        dec.end_utt().unwrap();
        assert_eq!(dec.get_hyp().0, "ab");
    }

    #[test]
    fn impossible_alignment_fails_after_retry() {
        let mut dec = align_decoder("ab");
        dec.start_utt().unwrap();
        // Three frames of silence can't fit two 3-state phones.
        feed(&mut dec.acmod, &[(0, 3)]);
        dec.process_raw(&[], false, false).unwrap();
        assert!(matches!(
            dec.end_utt(),
            Err(Error::AlignmentFailed { .. })
        ));
        // The decoder remains usable afterwards.
        assert!(dec.start_utt().is_ok());
    }

    #[test]
    fn full_utt_drains_the_front_end_immediately() {
        // 500 samples at 16kHz: one whole 410-sample window plus a 90-sample tail. Without the
        // full-utterance flag the tail sits in the front end and the lone cepstrum sits in the
        // delta window, so no features are out yet.
        let pcm: Vec<i16> = (0..500).map(|i| ((i * 37) % 251) as i16 - 125).collect();
        let mut dec = align_decoder("ab");
        dec.start_utt().unwrap();
        let n_plain = dec.process_raw(&pcm, true, false).unwrap();
        assert_eq!(n_plain, 0);

        // With it, the zero-padded tail frame and the delta window drain right away.
        let mut dec2 = align_decoder("ab");
        dec2.start_utt().unwrap();
        let n_full = dec2.process_raw(&pcm, true, true).unwrap();
        assert_eq!(n_full, 2);

        // And that is exactly what an explicit end_utt would have produced.
        let _ = dec.end_utt();
        assert_eq!(dec.n_frames(), n_full);
    }

    #[test]
    fn starved_search_reports_out_of_beam_then_empty_hyp() {
        let mut dec = toy_decoder();
        let mut b = FsgBuilder::new("g", 2, 0, 1, dec.lmath.clone());
        b.add_arc(0, 1, "ab", 1.0);
        dec.set_fsg(b.build().unwrap()).unwrap();
        dec.start_utt().unwrap();
        feed(&mut dec.acmod, &[(1, 3)]);
        // A non-finite frame scores every senone at the sentinel, killing all active paths.
        dec.acmod
            .push_feature(ndarray::arr1(&[f32::NAN, f32::NAN]));
        assert!(matches!(
            dec.process_raw(&[], false, false),
            Err(Error::OutOfBeam { .. })
        ));
        // Closing the utterance is still legal and yields the empty hypothesis: a success with
        // empty output, not an error.
        dec.end_utt().unwrap();
        let (hyp, score) = dec.get_hyp();
        assert!(hyp.is_empty());
        assert_eq!(score, WORST_SCORE);
        assert_eq!(dec.seg_iter().count(), 0);
    }

    #[test]
    fn posterior_available_with_bestpath() {
        let mut dec = align_decoder("ab");
        dec.config.bestpath = true;
        decode_spans(&mut dec, &[(0, 6), (1, 6), (2, 6), (0, 6)]);
        let lat = dec.lattice().expect("bestpath builds a lattice");
        assert!(lat.is_acyclic());
        let prob = dec.get_prob();
        assert!(prob <= 0);
    }
}
