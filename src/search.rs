//! Search strategy dispatch. The decoder drives whichever search is active through one small
//! trait (start / step / finish / hyp / segments); the two strategies in scope are the plain
//! FSG search and forced alignment, which is the same Viterbi run under a linear grammar plus
//! a widen-and-retry pass when the text doesn't fit in the beams.
use crate::acmod::Acmod;
use crate::dict::{Dict, WordId};
use crate::error::{Error, Result};
use crate::fsg::search::{FsgSearch, RETRY_WIDEN};
use crate::lattice::Lattice;
use tracing::{info, warn};

/// One word of the best path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seg {
    pub word: String,
    pub wid: WordId,
    /// Start frame, inclusive.
    pub sf: i32,
    /// End frame, inclusive.
    pub ef: i32,
    pub ascr: i32,
    pub lscr: i32,
}

pub trait SearchModule {
    fn start(&mut self);
    fn step(&mut self, acmod: &mut Acmod, frame: i32);
    /// Wind up the utterance; may re-decode retained features (alignment retry).
    fn finish(&mut self, acmod: &mut Acmod) -> Result<()>;
    fn hyp(&self, dict: &Dict) -> (String, i32);
    fn segments(&self, dict: &Dict) -> Vec<Seg>;
    fn lattice(&self, dict: &Dict) -> Option<Lattice>;
    fn n_frames(&self) -> i32;
    /// Live HMM count after the most recent step; zero means every path has died.
    fn n_active(&self) -> usize;
}

impl SearchModule for FsgSearch {
    fn start(&mut self) {
        FsgSearch::start(self);
    }

    fn step(&mut self, acmod: &mut Acmod, frame: i32) {
        FsgSearch::step(self, acmod, frame);
    }

    fn finish(&mut self, _acmod: &mut Acmod) -> Result<()> {
        FsgSearch::finish(self);
        Ok(())
    }

    fn hyp(&self, dict: &Dict) -> (String, i32) {
        FsgSearch::hyp(self, dict)
    }

    fn segments(&self, dict: &Dict) -> Vec<Seg> {
        FsgSearch::segments(self, dict)
    }

    fn lattice(&self, dict: &Dict) -> Option<Lattice> {
        let finals = self.final_entries();
        if finals.is_empty() {
            return None;
        }
        Some(Lattice::build(self.history(), dict, &finals))
    }

    fn n_frames(&self) -> i32 {
        FsgSearch::n_frames(self)
    }

    fn n_active(&self) -> usize {
        FsgSearch::n_active(self)
    }
}

/// Forced alignment: an FSG decode over the linear text grammar, retried once with widened
/// beams if the text can't be reached within them.
pub struct AlignSearch {
    pub inner: FsgSearch,
    pub text: String,
    retried: bool,
}

impl AlignSearch {
    pub fn new(inner: FsgSearch, text: String) -> Self {
        Self {
            inner,
            text,
            retried: false,
        }
    }
}

impl SearchModule for AlignSearch {
    fn start(&mut self) {
        self.inner.start();
    }

    fn step(&mut self, acmod: &mut Acmod, frame: i32) {
        self.inner.step(acmod, frame);
    }

    fn finish(&mut self, acmod: &mut Acmod) -> Result<()> {
        self.inner.finish();
        if !self.inner.reached_final() && !self.retried {
            warn!(
                text = %self.text,
                "alignment did not reach the final state, widening beams and retrying"
            );
            self.retried = true;
            self.inner.widen_beams(RETRY_WIDEN);
            self.inner.rerun(acmod);
        }
        if !self.inner.reached_final() {
            return Err(Error::AlignmentFailed {
                text: self.text.clone(),
            });
        }
        info!(text = %self.text, "alignment decode complete");
        Ok(())
    }

    fn hyp(&self, dict: &Dict) -> (String, i32) {
        self.inner.hyp(dict)
    }

    fn segments(&self, dict: &Dict) -> Vec<Seg> {
        self.inner.segments(dict)
    }

    fn lattice(&self, dict: &Dict) -> Option<Lattice> {
        SearchModule::lattice(&self.inner, dict)
    }

    fn n_frames(&self) -> i32 {
        self.inner.n_frames()
    }

    fn n_active(&self) -> usize {
        self.inner.n_active()
    }
}

/// The active search strategy, dispatched as a tagged variant.
pub enum Search {
    Fsg(FsgSearch),
    Align(AlignSearch),
}

impl Search {
    pub fn as_module(&mut self) -> &mut dyn SearchModule {
        match self {
            Search::Fsg(s) => s,
            Search::Align(s) => s,
        }
    }

    pub fn as_module_ref(&self) -> &dyn SearchModule {
        match self {
            Search::Fsg(s) => s,
            Search::Align(s) => s,
        }
    }

    pub fn is_align(&self) -> bool {
        matches!(self, Search::Align(_))
    }
}
