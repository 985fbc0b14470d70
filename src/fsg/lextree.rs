//! The compiled search graph: one HMM node ("pnode") per triphone occurrence on a grammar arc.
//!
//! For every grammar state we compile its outgoing word arcs into chains of pnodes. Arcs that
//! share their first two phones share entry chains (that is as far as triphone identity lets
//! prefixes collapse); the last phone of a word fans out into one leaf per compressed
//! right-context class so the exit score is correct for whichever word follows. Entry pnodes
//! carry a left-context phone set: a word transition only enters the variant matching the
//! previous word's final phone.
//!
//! Everything lives in one arena with `u32` successor indices; rebuilding after a grammar or
//! dictionary change just drops the arena.
use crate::acmod::mdef::{CiPhoneId, SsId};
use crate::dict::{Dict, WordId};
use crate::dict2pid::Dict2Pid;
use crate::fsg::model::FsgModel;
use crate::hmm::Hmm;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Small bitset over CI phone ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneSet {
    bits: Vec<u64>,
}

impl PhoneSet {
    pub fn empty(n: usize) -> Self {
        Self {
            bits: vec![0; (n + 63) / 64],
        }
    }

    pub fn full(n: usize) -> Self {
        let mut s = Self::empty(n);
        for i in 0..n {
            s.insert(i as CiPhoneId);
        }
        s
    }

    pub fn insert(&mut self, p: CiPhoneId) {
        self.bits[p as usize / 64] |= 1 << (p as usize % 64);
    }

    pub fn contains(&self, p: CiPhoneId) -> bool {
        self.bits[p as usize / 64] & (1 << (p as usize % 64)) != 0
    }

    pub fn union_with(&mut self, other: &PhoneSet) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
    }
}

/// Word-final data on a leaf pnode.
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub arc: u32,
    pub wid: WordId,
    /// Right contexts covered by this leaf's senone sequence class.
    pub rc_mask: PhoneSet,
    /// Correction from the shared entry language score to this arc's true one.
    pub lscr_adjust: i32,
    /// This arc's full language score (insertion penalties included).
    pub lscr: i32,
}

#[derive(Debug)]
pub struct PNode {
    pub hmm: Hmm,
    pub ci: CiPhoneId,
    pub ssid: SsId,
    pub tmatid: u32,
    /// Left contexts allowed to enter; only meaningful on root pnodes.
    pub lc_mask: PhoneSet,
    /// Language score applied on entry (shared max over arcs through this root).
    pub logprob: i32,
    pub next: Vec<u32>,
    pub leaf: Option<LeafInfo>,
}

/// Language weighting applied when compiling and transitioning.
#[derive(Debug, Clone, Copy)]
pub struct LangParams {
    /// Language weight; scales grammar log probabilities.
    pub lw: f32,
    /// Word insertion penalty, log domain.
    pub wip: i32,
    /// Per-phone insertion penalty, log domain.
    pub pip: i32,
}

impl LangParams {
    pub fn scale(&self, logprob: i32) -> i32 {
        (logprob as f64 * self.lw as f64) as i32
    }

    /// Full language score of an arc whose word has `n_phones` phones.
    fn word_score(&self, arc_logprob: i32, n_phones: usize) -> i32 {
        self.wip + self.scale(arc_logprob) + self.pip * n_phones as i32
    }
}

pub struct LexTree {
    pub pnodes: Vec<PNode>,
    /// Entry pnodes per grammar state.
    pub roots: Vec<Vec<u32>>,
    n_ci: usize,
}

impl LexTree {
    pub fn n_ci(&self) -> usize {
        self.n_ci
    }

    pub fn build(
        fsg: &FsgModel,
        dict: &Dict,
        d2p: &Arc<Dict2Pid>,
        params: LangParams,
    ) -> Self {
        let mdef = d2p.mdef();
        let n_ci = mdef.n_ciphone();
        let n_state = mdef.n_emit_state();

        // Left contexts per grammar state: last phones of words on arcs whose target's closure
        // includes the state, plus silence wherever the utterance can begin.
        let mut pred_lcs: Vec<PhoneSet> = vec![PhoneSet::empty(n_ci); fsg.n_state() as usize];
        for arc in fsg.arcs() {
            let Some(word) = arc.word else { continue };
            let Some(wid) = dict.wordid(fsg.word_str(word)) else {
                continue;
            };
            let last = dict.last_phone(wid);
            for &(s, _) in fsg.closure(arc.to) {
                pred_lcs[s as usize].insert(last);
            }
        }
        for &(s, _) in fsg.closure(fsg.start_state()) {
            pred_lcs[s as usize].insert(dict.silence_ci());
        }

        let mut tree = LexTree {
            pnodes: Vec::new(),
            roots: vec![Vec::new(); fsg.n_state() as usize],
            n_ci,
        };

        for state in 0..fsg.n_state() {
            // Group arcs by their first two phones so shared chains get a consistent shared
            // language score.
            let mut groups: BTreeMap<(CiPhoneId, Option<CiPhoneId>), Vec<(u32, WordId)>> =
                BTreeMap::new();
            for &arc_id in fsg.out_arcs(state) {
                let arc = fsg.arc(arc_id);
                let word = fsg.word_str(arc.word.expect("out_arcs are word arcs"));
                let Some(wid) = dict.wordid(word) else {
                    warn!("grammar word {word:?} not in dictionary, dropping arc");
                    continue;
                };
                let phones = dict.word(wid).phones();
                let key = (phones[0], phones.get(1).copied());
                groups.entry(key).or_default().push((arc_id, wid));
            }

            for ((first, second), arcs) in groups {
                let shared = arcs
                    .iter()
                    .map(|&(a, w)| {
                        params.word_score(fsg.arc(a).logprob, dict.word(w).phones().len())
                    })
                    .max()
                    .unwrap();
                match second {
                    None => {
                        for &(arc_id, wid) in &arcs {
                            tree.build_single_phone(
                                fsg, d2p, params, state, arc_id, wid, first,
                                &pred_lcs[state as usize], n_state,
                            );
                        }
                    }
                    Some(second) => {
                        tree.build_chain_group(
                            fsg, dict, d2p, params, state, &arcs, first, second, shared,
                            &pred_lcs[state as usize], n_state,
                        );
                    }
                }
            }
        }
        info!(
            pnodes = tree.pnodes.len(),
            states = fsg.n_state(),
            "lexicon tree compiled"
        );
        tree
    }

    fn alloc(
        &mut self,
        ci: CiPhoneId,
        ssid: SsId,
        tmatid: u32,
        lc_mask: PhoneSet,
        logprob: i32,
        n_state: usize,
    ) -> u32 {
        let id = self.pnodes.len() as u32;
        self.pnodes.push(PNode {
            hmm: Hmm::new(n_state),
            ci,
            ssid,
            tmatid,
            lc_mask,
            logprob,
            next: Vec::new(),
            leaf: None,
        });
        id
    }

    /// A single-phone word: the root is also a leaf, specialized on both contexts at once. One
    /// pnode per (left context, right-context class) pair, merged where tyings coincide.
    #[allow(clippy::too_many_arguments)]
    fn build_single_phone(
        &mut self,
        fsg: &FsgModel,
        d2p: &Arc<Dict2Pid>,
        params: LangParams,
        state: u32,
        arc_id: u32,
        wid: WordId,
        base: CiPhoneId,
        pred: &PhoneSet,
        n_state: usize,
    ) {
        let lscr = params.word_score(fsg.arc(arc_id).logprob, 1);
        let n_ci = self.n_ci;
        // (ssid, rc class signature) -> pnode, merging left contexts into the mask.
        let mut variants: BTreeMap<(SsId, Vec<u16>), u32> = BTreeMap::new();
        for lc in 0..n_ci as CiPhoneId {
            if !pred.contains(lc) {
                continue;
            }
            let row = d2p.lrssid(base, lc);
            for (class, &ssid) in row.ssid.iter().enumerate() {
                let mut rc_mask = PhoneSet::empty(n_ci);
                for rc in 0..n_ci as CiPhoneId {
                    if row.class_of(rc) as usize == class {
                        rc_mask.insert(rc);
                    }
                }
                let key = (ssid, row.cimap.clone());
                match variants.get(&key) {
                    Some(&id) => {
                        self.pnodes[id as usize].lc_mask.insert(lc);
                    }
                    None => {
                        let mut lc_mask = PhoneSet::empty(n_ci);
                        lc_mask.insert(lc);
                        let id =
                            self.alloc(base, ssid, d2p.tmat(base), lc_mask, lscr, n_state);
                        self.pnodes[id as usize].leaf = Some(LeafInfo {
                            arc: arc_id,
                            wid,
                            rc_mask,
                            lscr_adjust: 0,
                            lscr,
                        });
                        self.roots[state as usize].push(id);
                        variants.insert(key, id);
                    }
                }
            }
        }
    }

    /// Multi-phone words sharing a two-phone prefix: left-context-specialized roots, shared
    /// interior chains, per-right-context leaves.
    #[allow(clippy::too_many_arguments)]
    fn build_chain_group(
        &mut self,
        fsg: &FsgModel,
        dict: &Dict,
        d2p: &Arc<Dict2Pid>,
        params: LangParams,
        state: u32,
        arcs: &[(u32, WordId)],
        first: CiPhoneId,
        second: CiPhoneId,
        shared: i32,
        pred: &PhoneSet,
        n_state: usize,
    ) {
        let n_ci = self.n_ci;
        // Roots: group left contexts that map to the same entry ssid.
        let mut by_ssid: BTreeMap<SsId, PhoneSet> = BTreeMap::new();
        for lc in 0..n_ci as CiPhoneId {
            if !pred.contains(lc) {
                continue;
            }
            let ssid = d2p.ldiph(first, second, lc);
            by_ssid
                .entry(ssid)
                .or_insert_with(|| PhoneSet::empty(n_ci))
                .insert(lc);
        }
        let root_ids: Vec<u32> = by_ssid
            .into_iter()
            .map(|(ssid, lc_mask)| {
                let id = self.alloc(first, ssid, d2p.tmat(first), lc_mask, shared, n_state);
                self.roots[state as usize].push(id);
                id
            })
            .collect();

        // Interior chains, shared across arcs while the phone sequence matches.
        let mut interior: BTreeMap<Vec<CiPhoneId>, u32> = BTreeMap::new();
        for &(arc_id, wid) in arcs {
            let phones = dict.word(wid).phones().to_vec();
            let n = phones.len();
            let lscr = params.word_score(fsg.arc(arc_id).logprob, n);

            // Attach point for the rest of the word: the roots for a two-phone word's leaf,
            // otherwise the tail of the shared interior chain.
            let mut tails: Vec<u32> = root_ids.clone();
            for i in 1..n - 1 {
                let ssid = d2p.internal(phones[i], phones[i - 1], phones[i + 1]);
                let key = phones[..=i + 1].to_vec();
                let id = match interior.get(&key) {
                    Some(&id) => id,
                    None => {
                        let id = self.alloc(
                            phones[i],
                            ssid,
                            d2p.tmat(phones[i]),
                            PhoneSet::empty(n_ci),
                            0,
                            n_state,
                        );
                        for &t in &tails {
                            self.pnodes[t as usize].next.push(id);
                        }
                        interior.insert(key, id);
                        id
                    }
                };
                tails = vec![id];
            }

            // Leaves: one per compressed right-context class, never shared.
            let last = phones[n - 1];
            let row = d2p.rssid(last, phones[n - 2]);
            for (class, &ssid) in row.ssid.iter().enumerate() {
                let mut rc_mask = PhoneSet::empty(n_ci);
                for rc in 0..n_ci as CiPhoneId {
                    if row.class_of(rc) as usize == class {
                        rc_mask.insert(rc);
                    }
                }
                let id = self.alloc(
                    last,
                    ssid,
                    d2p.tmat(last),
                    PhoneSet::empty(n_ci),
                    0,
                    n_state,
                );
                self.pnodes[id as usize].leaf = Some(LeafInfo {
                    arc: arc_id,
                    wid,
                    rc_mask,
                    lscr_adjust: lscr - shared,
                    lscr,
                });
                for &t in &tails {
                    self.pnodes[t as usize].next.push(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acmod::mdef::tests::toy_mdef;
    use crate::fsg::model::FsgBuilder;
    use crate::logmath::LogMath;

    fn setup(words: &[(&str, &[&str])]) -> (Arc<FsgModel>, Dict, Arc<Dict2Pid>) {
        let mdef = Arc::new(toy_mdef());
        let mut dict = Dict::new(mdef.clone()).unwrap();
        for (w, phones) in words {
            dict.add_word_str(w, phones, false).unwrap();
        }
        let d2p = Arc::new(Dict2Pid::build(mdef));
        let lmath = Arc::new(LogMath::new(1.0001, 0).unwrap());
        let mut b = FsgBuilder::new("t", 3, 0, 2, lmath);
        for (w, _) in words {
            b.add_arc(0, 1, w, 0.5);
        }
        b.add_arc(1, 2, words[0].0, 1.0);
        (Arc::new(b.build().unwrap()), dict, d2p)
    }

    fn params() -> LangParams {
        LangParams {
            lw: 1.0,
            wip: 0,
            pip: 0,
        }
    }

    #[test]
    fn chains_have_word_final_leaves() {
        let (fsg, dict, d2p) = setup(&[("aba", &["AX", "B", "AX"])]);
        let tree = LexTree::build(&fsg, &dict, &d2p, params());
        assert!(!tree.roots[0].is_empty());
        // Every root must reach a leaf carrying the word.
        let mut stack: Vec<u32> = tree.roots[0].clone();
        let mut found_leaf = false;
        let mut seen = vec![false; tree.pnodes.len()];
        while let Some(id) = stack.pop() {
            if seen[id as usize] {
                continue;
            }
            seen[id as usize] = true;
            let p = &tree.pnodes[id as usize];
            if let Some(leaf) = &p.leaf {
                found_leaf = true;
                assert_eq!(dict.word(leaf.wid).text(), "aba");
                assert!(p.next.is_empty());
            }
            stack.extend(p.next.iter().copied());
        }
        assert!(found_leaf);
    }

    #[test]
    fn shared_prefix_collapses() {
        // Same first two phones: chains share the entry pnodes.
        let (fsg, dict, d2p) = setup(&[
            ("aba", &["AX", "B", "AX"]),
            ("ab", &["AX", "B"]),
        ]);
        let tree = LexTree::build(&fsg, &dict, &d2p, params());
        // Independent compilation would duplicate the roots; sharing keeps one set.
        let (fsg1, dict1, d2p1) = setup(&[("aba", &["AX", "B", "AX"])]);
        let solo = LexTree::build(&fsg1, &dict1, &d2p1, params());
        let (fsg2, dict2, d2p2) = setup(&[("ab", &["AX", "B"])]);
        let solo2 = LexTree::build(&fsg2, &dict2, &d2p2, params());
        let roots1: usize = solo.roots[0].len();
        let roots2: usize = solo2.roots[0].len();
        assert!(tree.roots[0].len() < roots1 + roots2);
    }

    #[test]
    fn leaf_rc_classes_cover_all_phones() {
        let (fsg, dict, d2p) = setup(&[("aba", &["AX", "B", "AX"])]);
        let tree = LexTree::build(&fsg, &dict, &d2p, params());
        let n_ci = tree.n_ci();
        for p in &tree.pnodes {
            if let Some(leaf) = &p.leaf {
                // Union of sibling leaf masks covers every phone; at minimum each leaf is
                // nonempty.
                assert!((0..n_ci as u16).any(|rc| leaf.rc_mask.contains(rc)));
            }
        }
        // Collect leaves of one arc and check coverage.
        let mut cover = PhoneSet::empty(n_ci);
        for p in &tree.pnodes {
            if let Some(leaf) = &p.leaf {
                if leaf.arc == 0 {
                    cover.union_with(&leaf.rc_mask);
                }
            }
        }
        for rc in 0..n_ci as u16 {
            assert!(cover.contains(rc));
        }
    }

    #[test]
    fn single_phone_words_are_root_leaves() {
        let (fsg, dict, d2p) = setup(&[("a", &["AX"])]);
        let tree = LexTree::build(&fsg, &dict, &d2p, params());
        for &r in &tree.roots[0] {
            let p = &tree.pnodes[r as usize];
            assert!(p.leaf.is_some());
            assert!(p.next.is_empty());
        }
    }

    #[test]
    fn language_score_adjustments_reconcile() {
        let lmath = Arc::new(LogMath::new(1.0001, 0).unwrap());
        let mdef = Arc::new(toy_mdef());
        let mut dict = Dict::new(mdef.clone()).unwrap();
        dict.add_word_str("aba", &["AX", "B", "AX"], false).unwrap();
        dict.add_word_str("abab", &["AX", "B", "AX", "B"], false).unwrap();
        let d2p = Arc::new(Dict2Pid::build(mdef));
        let mut b = FsgBuilder::new("t", 2, 0, 1, lmath.clone());
        b.add_arc(0, 1, "aba", 0.9);
        b.add_arc(0, 1, "abab", 0.1);
        let fsg = b.build().unwrap();
        let p = LangParams {
            lw: 2.0,
            wip: -5,
            pip: -1,
        };
        let tree = LexTree::build(&fsg, &dict, &d2p, p);
        // Shared entry applies the best arc's score; each leaf's entry+adjust equals its own
        // arc's true language score.
        for node in &tree.pnodes {
            if let Some(leaf) = &node.leaf {
                let root_applied = tree.pnodes[tree.roots[0][0] as usize].logprob;
                assert_eq!(root_applied + leaf.lscr_adjust, leaf.lscr);
            }
        }
    }
}
