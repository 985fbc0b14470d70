//! Time-synchronous Viterbi over the compiled lexicon tree.
//!
//! Per frame: union the active pnodes' senones and score them, run every active HMM forward,
//! prune against the frame best with the three beams (state survival, phone propagation, word
//! exit), record word exits in the history arena, then fire grammar transitions from this
//! frame's new history entries into entry pnodes for the next frame.
//!
//! Absolute pruning rides on a dynamic beam factor: when the active HMM count passes
//! `maxhmmpf` the effective beams tighten a notch each frame until the count falls back under
//! the cap, then relax toward the configured beams.
use crate::acmod::mdef::{CiPhoneId, Mdef};
use crate::acmod::tmat::Tmat;
use crate::acmod::Acmod;
use crate::config::Config;
use crate::dict::Dict;
use crate::dict2pid::Dict2Pid;
use crate::error::{Error, Result};
use crate::fsg::history::{HistEntry, History, NO_HIST};
use crate::fsg::lextree::{LangParams, LexTree};
use crate::fsg::model::FsgModel;
use crate::logmath::{LogMath, WORST_SCORE};
use crate::search::Seg;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Multiplier applied to the beam factor while over the HMM cap.
const BEAM_TIGHTEN: f32 = 0.9;
const BEAM_FACTOR_FLOOR: f32 = 0.1;
/// Log-domain widening applied when a forced alignment fails and retries.
pub const RETRY_WIDEN: f32 = 4.0;

pub struct FsgSearch {
    pub fsg: Arc<FsgModel>,
    mdef: Arc<Mdef>,
    tmat: Arc<Tmat>,
    lextree: LexTree,
    history: History,
    params: LangParams,
    sil_ci: CiPhoneId,

    beam_orig: i32,
    pbeam_orig: i32,
    wbeam_orig: i32,
    beam_factor: f32,
    beam: i32,
    pbeam: i32,
    wbeam: i32,
    maxhmmpf: i32,
    maxwpf: i32,

    frame: i32,
    finished: bool,
    bestscore: i32,

    active: Vec<u32>,
    active_next: Vec<u32>,

    /// Best final history entry after `finish`, or [`NO_HIST`].
    final_entry: i32,
    n_hmm_eval: u64,
}

impl FsgSearch {
    pub fn new(
        fsg: Arc<FsgModel>,
        dict: &Dict,
        d2p: &Arc<Dict2Pid>,
        config: &Config,
        lmath: &LogMath,
        tmat: Arc<Tmat>,
    ) -> Result<Self> {
        let params = LangParams {
            lw: config.lw,
            wip: lmath.log(config.wip),
            pip: lmath.log(config.pip),
        };
        let lextree = LexTree::build(&fsg, dict, d2p, params);
        let startable = fsg
            .closure(fsg.start_state())
            .iter()
            .any(|&(s, _)| !lextree.roots[s as usize].is_empty());
        if !startable {
            return Err(Error::InvalidConfig(
                "grammar has no startable words (dictionary coverage?)".into(),
            ));
        }
        let beam_orig = lmath.log(config.beam);
        let pbeam_orig = lmath.log(config.pbeam);
        let wbeam_orig = lmath.log(config.wbeam);
        info!(
            grammar = %fsg.name(),
            beam = beam_orig,
            wbeam = wbeam_orig,
            "FSG search ready"
        );
        Ok(Self {
            fsg,
            mdef: d2p.mdef().clone(),
            tmat,
            lextree,
            history: History::new(),
            params,
            sil_ci: dict.silence_ci(),
            beam_orig,
            pbeam_orig,
            wbeam_orig,
            beam_factor: 1.0,
            beam: beam_orig,
            pbeam: pbeam_orig,
            wbeam: wbeam_orig,
            maxhmmpf: config.maxhmmpf,
            maxwpf: config.maxwpf,
            frame: 0,
            finished: false,
            bestscore: 0,
            active: Vec::new(),
            active_next: Vec::new(),
            final_entry: NO_HIST,
            n_hmm_eval: 0,
        })
    }

    /// Widen all beams (used by the forced-alignment retry). Beams are log-domain negatives,
    /// so scaling the magnitude up loosens pruning.
    pub fn widen_beams(&mut self, factor: f32) {
        self.beam_orig = (self.beam_orig as f64 * factor as f64) as i32;
        self.pbeam_orig = (self.pbeam_orig as f64 * factor as f64) as i32;
        self.wbeam_orig = (self.wbeam_orig as f64 * factor as f64) as i32;
    }

    pub fn start(&mut self) {
        for p in &mut self.lextree.pnodes {
            p.hmm.clear();
        }
        self.history.reset();
        self.active.clear();
        self.active_next.clear();
        self.frame = 0;
        self.finished = false;
        self.final_entry = NO_HIST;
        self.beam_factor = 1.0;
        self.beam = self.beam_orig;
        self.pbeam = self.pbeam_orig;
        self.wbeam = self.wbeam_orig;
        self.n_hmm_eval = 0;

        // Enter the grammar: every root reachable through the start state's epsilon closure,
        // with silence as the virtual left context.
        let sil = self.sil_ci;
        let entries = self.fsg.closure(self.fsg.start_state()).to_vec();
        for (state, eps_lp) in entries {
            let roots = self.lextree.roots[state as usize].clone();
            for root in roots {
                let p = &self.lextree.pnodes[root as usize];
                if !p.lc_mask.contains(sil) {
                    continue;
                }
                let score = self.params.scale(eps_lp) + p.logprob;
                self.enter_pnode(root, score, NO_HIST, 0);
            }
        }
        std::mem::swap(&mut self.active, &mut self.active_next);
        self.active_next.clear();
    }

    fn enter_pnode(&mut self, id: u32, score: i32, hist: i32, frame: i32) {
        let p = &mut self.lextree.pnodes[id as usize];
        if p.hmm.frame != frame {
            p.hmm.clear();
            self.active_next.push(id);
        }
        p.hmm.enter(score, hist, frame);
    }

    /// One frame of search. `frame` must advance by exactly one each call.
    pub fn step(&mut self, acmod: &mut Acmod, frame: i32) {
        debug_assert_eq!(frame, self.frame);
        self.history.start_frame(frame);

        // Senone activation for this frame.
        acmod.clear_active();
        for &id in &self.active {
            let p = &self.lextree.pnodes[id as usize];
            for &sen in self.mdef.sseq(p.ssid) {
                acmod.activate(sen);
            }
        }
        let scores = acmod.score_frame(frame).to_vec();

        // HMM updates.
        let mut best = WORST_SCORE;
        for &id in &self.active {
            let p = &mut self.lextree.pnodes[id as usize];
            let s = p.hmm.eval(&self.tmat, p.tmatid, self.mdef.sseq(p.ssid), &scores);
            if s > best {
                best = s;
            }
            self.n_hmm_eval += 1;
        }
        self.bestscore = best;

        // Absolute pruning through the beam factor.
        if self.maxhmmpf > 0 {
            if self.active.len() as i32 > self.maxhmmpf {
                self.beam_factor = (self.beam_factor * BEAM_TIGHTEN).max(BEAM_FACTOR_FLOOR);
            } else if self.beam_factor < 1.0 {
                self.beam_factor = (self.beam_factor / BEAM_TIGHTEN).min(1.0);
            }
            self.beam = (self.beam_orig as f64 * self.beam_factor as f64) as i32;
            self.pbeam = (self.pbeam_orig as f64 * self.beam_factor as f64) as i32;
            self.wbeam = (self.wbeam_orig as f64 * self.beam_factor as f64) as i32;
        }

        let beam_thresh = best + self.beam;
        let pbeam_thresh = best + self.pbeam;
        let wbeam_thresh = best + self.wbeam;

        // Prune, collect phone propagations and word exits.
        let mut phone_props: Vec<(u32, i32, i32)> = Vec::new();
        let mut clears: Vec<u32> = Vec::new();
        let active = std::mem::take(&mut self.active);
        for &id in &active {
            let p = &self.lextree.pnodes[id as usize];
            let bs = p.hmm.bestscore();
            let out = p.hmm.out_score();
            let out_hist = p.hmm.out_hist();
            let survives = best > WORST_SCORE && bs > WORST_SCORE && bs >= beam_thresh;

            if out > WORST_SCORE && out >= pbeam_thresh {
                match &p.leaf {
                    None => phone_props.push((id, out, out_hist)),
                    Some(leaf) => {
                        if out >= wbeam_thresh {
                            let score = out + leaf.lscr_adjust;
                            self.history.push(HistEntry {
                                score,
                                frame,
                                arc: leaf.arc,
                                wid: leaf.wid,
                                last_ci: p.ci,
                                prev: out_hist,
                                lscr: leaf.lscr,
                                rc_mask: leaf.rc_mask.clone(),
                            });
                        }
                    }
                }
            }
            if survives {
                let p = &mut self.lextree.pnodes[id as usize];
                p.hmm.frame = frame + 1;
                self.active_next.push(id);
            } else {
                clears.push(id);
            }
        }
        for id in clears {
            self.lextree.pnodes[id as usize].hmm.clear();
        }

        // Phone transitions within words.
        for (id, out, hist) in phone_props {
            let succs = self.lextree.pnodes[id as usize].next.clone();
            for succ in succs {
                self.enter_pnode(succ, out, hist, frame + 1);
            }
        }

        // Word transitions from this frame's new history entries. `maxwpf` caps how many may
        // seed new words; the arena keeps them all for the backtrace either way.
        let n_entries = self.history.len();
        let first = n_entries - self.history.frame_entries(frame).count();
        let mut transition_ids: Vec<usize> = (first..n_entries).collect();
        if self.maxwpf > 0 && transition_ids.len() > self.maxwpf as usize {
            transition_ids
                .sort_by_key(|&id| std::cmp::Reverse(self.history.entry(id as i32).score));
            transition_ids.truncate(self.maxwpf as usize);
        }
        for hist_id in transition_ids {
            let e = self.history.entry(hist_id as i32).clone();
            let to = self.fsg.arc(e.arc).to;
            let closure = self.fsg.closure(to).to_vec();
            for (state, eps_lp) in closure {
                let roots = self.lextree.roots[state as usize].clone();
                for root in roots {
                    let p = &self.lextree.pnodes[root as usize];
                    if !p.lc_mask.contains(e.last_ci) || !e.rc_mask.contains(p.ci) {
                        continue;
                    }
                    let score = e.score + self.params.scale(eps_lp) + p.logprob;
                    self.enter_pnode(root, score, hist_id as i32, frame + 1);
                }
            }
        }

        std::mem::swap(&mut self.active, &mut self.active_next);
        self.active_next.clear();
        self.frame += 1;
    }

    /// Close the utterance: pick the best history entry whose grammar state reaches final.
    pub fn finish(&mut self) {
        self.finished = true;
        let last_frame = self.frame - 1;

        let mut best_id = NO_HIST;
        let mut best_score = WORST_SCORE;
        if last_frame >= 0 && !self.history.is_empty() {
            for (id, e) in self.history.frame_entries(last_frame) {
                if e.score > best_score && self.fsg.reaches_final(self.fsg.arc(e.arc).to) {
                    best_score = e.score;
                    best_id = id;
                }
            }
            if best_id == NO_HIST {
                for (id, e) in self.history.iter() {
                    if e.score > best_score && self.fsg.reaches_final(self.fsg.arc(e.arc).to) {
                        best_score = e.score;
                        best_id = id;
                    }
                }
                if best_id != NO_HIST {
                    warn!("no path reached the final state in the last frame, backing off");
                }
            }
            if best_id == NO_HIST {
                warn!("no path reached the final grammar state, hypothesis is partial");
                for (id, e) in self.history.iter() {
                    if e.score > best_score {
                        best_score = e.score;
                        best_id = id;
                    }
                }
            }
        }
        self.final_entry = best_id;
        debug!(
            frames = self.frame,
            hmm_evals = self.n_hmm_eval,
            entries = self.history.len(),
            final_entry = self.final_entry,
            "search finished"
        );
    }

    /// Whether the chosen path actually reaches the grammar's final state.
    pub fn reached_final(&self) -> bool {
        self.final_entry != NO_HIST
            && self
                .fsg
                .reaches_final(self.fsg.arc(self.history.entry(self.final_entry).arc).to)
    }

    /// Re-decode the retained utterance features from scratch (forced-alignment retry path).
    pub fn rerun(&mut self, acmod: &mut Acmod) {
        acmod.rewind();
        self.start();
        for f in 0..acmod.n_frames() as i32 {
            self.step(acmod, f);
        }
        self.finish();
    }

    /// Hypothesis text (real words only) and its path score. Empty with `WORST_SCORE` when
    /// nothing survived: that is a valid result, not an error.
    pub fn hyp(&self, dict: &Dict) -> (String, i32) {
        if self.final_entry == NO_HIST {
            return (String::new(), WORST_SCORE);
        }
        let chain = self.history.backtrace(self.final_entry);
        let words: Vec<&str> = chain
            .iter()
            .map(|&id| self.history.entry(id))
            .filter(|e| dict.real_word(e.wid))
            .map(|e| dict.word(e.wid).text())
            .collect();
        let score = self.history.entry(self.final_entry).score;
        (words.join(" "), score)
    }

    /// Word segmentation of the best path, fillers included.
    pub fn segments(&self, dict: &Dict) -> Vec<Seg> {
        if self.final_entry == NO_HIST {
            return Vec::new();
        }
        let chain = self.history.backtrace(self.final_entry);
        let mut segs = Vec::with_capacity(chain.len());
        let mut prev_score = 0i32;
        let mut prev_frame = -1i32;
        for &id in &chain {
            let e = self.history.entry(id);
            segs.push(Seg {
                word: dict.word(e.wid).text().to_string(),
                wid: e.wid,
                sf: prev_frame + 1,
                ef: e.frame,
                ascr: e.score - prev_score - e.lscr,
                lscr: e.lscr,
            });
            prev_score = e.score;
            prev_frame = e.frame;
        }
        segs
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// History entries that legitimately end the utterance: last-frame exits whose grammar
    /// state reaches final, falling back to whatever `finish` chose.
    pub fn final_entries(&self) -> Vec<i32> {
        let last_frame = self.frame - 1;
        let mut out = Vec::new();
        if last_frame >= 0 && !self.history.is_empty() {
            for (id, e) in self.history.frame_entries(last_frame) {
                if self.fsg.reaches_final(self.fsg.arc(e.arc).to) {
                    out.push(id);
                }
            }
        }
        if out.is_empty() && self.final_entry != NO_HIST {
            out.push(self.final_entry);
        }
        out
    }

    pub fn final_entry(&self) -> i32 {
        self.final_entry
    }

    pub fn n_frames(&self) -> i32 {
        self.frame
    }

    pub fn n_active(&self) -> usize {
        self.active.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Best HMM score seen in the most recent frame.
    pub fn bestscore(&self) -> i32 {
        self.bestscore
    }
}
