//! Multi-level alignment: three parallel entry vectors (words, phones, states) where every
//! entry carries its frame span, a score, and parent/child indices into the neighboring levels.
//! Children of an entry are contiguous, first child starts at the parent's start frame, and
//! siblings tile the parent exactly; those invariants are what make the iterators trivial.
//!
//! The aligner itself is a small exact Viterbi run per word: the word segmentation is already
//! fixed (by the first decoding pass), so each word's phone chain is aligned independently
//! within its frames, with full per-frame backpointers. No beams, no pruning; word segments are
//! short enough that exactness is cheap.
use crate::acmod::mdef::{CiPhoneId, SenoneId, SsId, WordPosition};
use crate::acmod::Acmod;
use crate::dict::{Dict, WordId};
use crate::dict2pid::Dict2Pid;
use crate::error::{Error, Result};
use crate::logmath::WORST_SCORE;
use crate::search::Seg;
use tracing::debug;

/// No parent / no child sentinel.
pub const NONE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignId {
    Word { wid: WordId, text: String },
    Phone {
        ci: CiPhoneId,
        name: String,
        ssid: SsId,
        tmatid: u32,
    },
    State(SenoneId),
}

#[derive(Debug, Clone)]
pub struct AlignEntry {
    pub start: i32,
    pub duration: i32,
    pub score: i32,
    pub parent: i32,
    pub child: i32,
    pub id: AlignId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Word,
    Phone,
    State,
}

#[derive(Debug, Default)]
pub struct Alignment {
    words: Vec<AlignEntry>,
    phones: Vec<AlignEntry>,
    states: Vec<AlignEntry>,
}

impl Alignment {
    pub fn n_words(&self) -> usize {
        self.words.len()
    }

    pub fn n_phones(&self) -> usize {
        self.phones.len()
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    fn level(&self, level: Level) -> &[AlignEntry] {
        match level {
            Level::Word => &self.words,
            Level::Phone => &self.phones,
            Level::State => &self.states,
        }
    }

    pub fn words(&self) -> AlignIter<'_> {
        AlignIter {
            al: self,
            level: Level::Word,
            pos: 0,
            end: self.words.len(),
        }
    }

    pub fn phones(&self) -> AlignIter<'_> {
        AlignIter {
            al: self,
            level: Level::Phone,
            pos: 0,
            end: self.phones.len(),
        }
    }

    pub fn states(&self) -> AlignIter<'_> {
        AlignIter {
            al: self,
            level: Level::State,
            pos: 0,
            end: self.states.len(),
        }
    }
}

/// Linear traversal over one level, yielding positions that can descend to their children.
pub struct AlignIter<'a> {
    al: &'a Alignment,
    level: Level,
    pos: usize,
    end: usize,
}

impl<'a> Iterator for AlignIter<'a> {
    type Item = AlignPos<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let item = AlignPos {
            al: self.al,
            level: self.level,
            idx: self.pos,
        };
        self.pos += 1;
        Some(item)
    }
}

#[derive(Clone, Copy)]
pub struct AlignPos<'a> {
    al: &'a Alignment,
    level: Level,
    idx: usize,
}

impl<'a> AlignPos<'a> {
    pub fn entry(&self) -> &'a AlignEntry {
        &self.al.level(self.level)[self.idx]
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    /// `(start, duration, score)` of this segment.
    pub fn seg(&self) -> (i32, i32, i32) {
        let e = self.entry();
        (e.start, e.duration, e.score)
    }

    pub fn name(&self) -> String {
        match &self.entry().id {
            AlignId::Word { text, .. } => text.clone(),
            AlignId::Phone { name, .. } => name.clone(),
            AlignId::State(sen) => sen.to_string(),
        }
    }

    /// Iterate this entry's children on the next level down; empty at the state level.
    pub fn children(&self) -> AlignIter<'a> {
        let (child_level, child_vec_len) = match self.level {
            Level::Word => (Level::Phone, self.al.phones.len()),
            Level::Phone => (Level::State, self.al.states.len()),
            Level::State => (Level::State, 0),
        };
        let e = self.entry();
        if self.level == Level::State || e.child == NONE {
            return AlignIter {
                al: self.al,
                level: child_level,
                pos: 0,
                end: 0,
            };
        }
        let start = e.child as usize;
        let mut end = start;
        let children = self.al.level(child_level);
        while end < child_vec_len && children[end].parent == self.idx as i32 {
            end += 1;
        }
        AlignIter {
            al: self.al,
            level: child_level,
            pos: start,
            end,
        }
    }
}

/// One emitting state in a word's concatenated phone chain.
struct ChainState {
    sen: SenoneId,
    tmatid: u32,
    phone: usize,
    state: usize,
}

/// Align every word of a finished utterance. `segs` fixes the word boundaries; phones and
/// states are Viterbi-aligned within them against the retained features.
pub fn align_utterance(
    segs: &[Seg],
    dict: &Dict,
    d2p: &Dict2Pid,
    acmod: &mut Acmod,
) -> Result<Alignment> {
    let mut al = Alignment::default();
    let mdef = d2p.mdef().clone();
    let sil = dict.silence_ci();

    acmod.rewind();
    for (i, seg) in segs.iter().enumerate() {
        let lc = if i == 0 {
            sil
        } else {
            dict.last_phone(segs[i - 1].wid)
        };
        let rc = match segs.get(i + 1) {
            Some(next) => dict.first_phone(next.wid),
            None => sil,
        };
        let phones = dict.word(seg.wid).phones().to_vec();
        let n = phones.len();

        // Resolve each phone to its context-dependent tying.
        let mut chain: Vec<ChainState> = Vec::new();
        let mut phone_meta: Vec<(CiPhoneId, SsId, u32)> = Vec::new();
        for (pi, &p) in phones.iter().enumerate() {
            let (l, r, pos) = if n == 1 {
                (lc, rc, WordPosition::Single)
            } else if pi == 0 {
                (lc, phones[1], WordPosition::Begin)
            } else if pi == n - 1 {
                (phones[n - 2], rc, WordPosition::End)
            } else {
                (phones[pi - 1], phones[pi + 1], WordPosition::Internal)
            };
            let pid = mdef.phone_id(p, l, r, pos);
            let ssid = mdef.phone(pid).ssid;
            let tmatid = mdef.phone(pid).tmat;
            phone_meta.push((p, ssid, tmatid));
            for (si, &sen) in mdef.sseq(ssid).iter().enumerate() {
                chain.push(ChainState {
                    sen,
                    tmatid,
                    phone: pi,
                    state: si,
                });
            }
        }

        let word_idx = al.words.len() as i32;
        al.words.push(AlignEntry {
            start: seg.sf,
            duration: seg.ef - seg.sf + 1,
            score: 0,
            parent: NONE,
            child: NONE,
            id: AlignId::Word {
                wid: seg.wid,
                text: seg.word.clone(),
            },
        });

        align_word(
            &mut al, acmod, &chain, &phone_meta, word_idx, seg, &mdef,
        )?;
    }

    debug!(
        words = al.n_words(),
        phones = al.n_phones(),
        states = al.n_states(),
        "alignment complete"
    );
    Ok(al)
}

#[allow(clippy::too_many_arguments)]
fn align_word(
    al: &mut Alignment,
    acmod: &mut Acmod,
    chain: &[ChainState],
    phone_meta: &[(CiPhoneId, SsId, u32)],
    word_idx: i32,
    seg: &Seg,
    mdef: &std::sync::Arc<crate::acmod::mdef::Mdef>,
) -> Result<()> {
    let n_frames = (seg.ef - seg.sf + 1) as usize;
    let n_chain = chain.len();
    let n_emit = mdef.n_emit_state();
    let tmat = acmod.tmat.clone();

    // Per-frame emission scores for the chain states.
    let mut emit = vec![vec![WORST_SCORE; n_chain]; n_frames];
    for f in 0..n_frames {
        let frame = seg.sf + f as i32;
        acmod.clear_active();
        for cs in chain {
            acmod.activate(cs.sen);
        }
        let scores = acmod.score_frame(frame);
        for (ci, cs) in chain.iter().enumerate() {
            emit[f][ci] = scores[cs.sen as usize];
        }
    }

    let fail = || Error::AlignmentFailed {
        text: seg.word.clone(),
    };

    // Exact Viterbi with full backpointers.
    let mut cur = vec![WORST_SCORE; n_chain];
    let mut bp = vec![vec![NONE; n_chain]; n_frames];
    cur[0] = emit[0][0];
    for f in 1..n_frames {
        let mut next = vec![WORST_SCORE; n_chain];
        for (j, cs) in chain.iter().enumerate() {
            let mut best = WORST_SCORE;
            let mut best_p = NONE;
            // Within-phone predecessors.
            for i in 0..=cs.state {
                let gi = j - (cs.state - i);
                if cur[gi] <= WORST_SCORE {
                    continue;
                }
                let tp = tmat.prob(cs.tmatid, i, cs.state);
                if tp <= WORST_SCORE {
                    continue;
                }
                let s = cur[gi] + tp;
                if s > best {
                    best = s;
                    best_p = gi as i32;
                }
            }
            // Cross-phone: previous phone's exit into our state 0.
            if cs.state == 0 && cs.phone > 0 {
                let prev_tmat = phone_meta[cs.phone - 1].2;
                for i in 0..n_emit {
                    let gi = j - n_emit + i;
                    if cur[gi] <= WORST_SCORE {
                        continue;
                    }
                    let tp = tmat.prob(prev_tmat, i, n_emit);
                    if tp <= WORST_SCORE {
                        continue;
                    }
                    let s = cur[gi] + tp;
                    if s > best {
                        best = s;
                        best_p = gi as i32;
                    }
                }
            }
            if best > WORST_SCORE && emit[f][j] > WORST_SCORE {
                next[j] = best + emit[f][j];
                bp[f][j] = best_p;
            }
        }
        cur = next;
    }

    // Must exit the last phone exactly at the segment end.
    let last_tmat = phone_meta.last().unwrap().2;
    let mut end_state = NONE;
    let mut end_score = WORST_SCORE;
    for i in 0..n_emit {
        let gi = n_chain - n_emit + i;
        if cur[gi] <= WORST_SCORE {
            continue;
        }
        let tp = tmat.prob(last_tmat, i, n_emit);
        if tp <= WORST_SCORE {
            continue;
        }
        if cur[gi] + tp > end_score {
            end_score = cur[gi] + tp;
            end_state = gi as i32;
        }
    }
    if end_state == NONE {
        return Err(fail());
    }

    // Backtrace: chain state occupied at each frame.
    let mut occupied = vec![0usize; n_frames];
    let mut s = end_state as usize;
    for f in (0..n_frames).rev() {
        occupied[f] = s;
        if f > 0 {
            let p = bp[f][s];
            if p == NONE {
                return Err(fail());
            }
            s = p as usize;
        }
    }

    // Group into state runs, then phones.
    let mut word_score = 0i32;
    let mut cur_phone = NONE;
    for f in 0..n_frames {
        let cs = &chain[occupied[f]];
        let frame = seg.sf + f as i32;
        let emit_score = emit[f][occupied[f]];
        word_score += emit_score;
        if cur_phone != cs.phone as i32 {
            let (ci, ssid, tmatid) = phone_meta[cs.phone];
            al.phones.push(AlignEntry {
                start: frame,
                duration: 0,
                score: 0,
                parent: word_idx,
                child: NONE,
                id: AlignId::Phone {
                    ci,
                    name: mdef.ciphone_name(ci).to_string(),
                    ssid,
                    tmatid,
                },
            });
            if al.words[word_idx as usize].child == NONE {
                al.words[word_idx as usize].child = al.phones.len() as i32 - 1;
            }
            cur_phone = cs.phone as i32;
        }
        let phone_idx = al.phones.len() - 1;
        al.phones[phone_idx].duration += 1;
        al.phones[phone_idx].score += emit_score;

        // A state run is a maximal span of frames in the same chain state.
        let new_state = f == 0 || occupied[f] != occupied[f - 1];
        if new_state {
            al.states.push(AlignEntry {
                start: frame,
                duration: 0,
                score: 0,
                parent: phone_idx as i32,
                child: NONE,
                id: AlignId::State(cs.sen),
            });
            if al.phones[phone_idx].child == NONE {
                al.phones[phone_idx].child = al.states.len() as i32 - 1;
            }
        }
        let st = al.states.len() - 1;
        al.states[st].duration += 1;
        al.states[st].score += emit_score;
    }
    al.words[word_idx as usize].score = word_score;
    Ok(())
}
