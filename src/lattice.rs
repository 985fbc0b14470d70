//! Word lattice: the history arena folded into a DAG of word occurrences, for best-path
//! rescoring and posterior probabilities.
//!
//! Nodes are distinct `(word, start frame)` pairs; a link is one history entry connecting a
//! node to its successor, carrying the acoustic and language score split. Links are naturally
//! topologically ordered by end frame, which makes the forward/backward pass a pair of sorted
//! sweeps. Posteriors scale the acoustic score down by `ascale` before the log-add, the usual
//! trick to keep one arbitrarily peaked acoustic path from swallowing the whole distribution.
use crate::dict::{Dict, WordId};
use crate::fsg::history::{History, NO_HIST};
use crate::logmath::{LogMath, WORST_SCORE};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LatNode {
    pub wid: WordId,
    pub word: String,
    /// Start frame.
    pub sf: i32,
    /// Links out of / into this node.
    pub exits: Vec<u32>,
    pub entries: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct LatLink {
    pub from: u32,
    pub to: u32,
    /// End frame of the `from` node's word occurrence.
    pub ef: i32,
    pub ascr: i32,
    pub lscr: i32,
    /// Posterior log probability, filled in by [`Lattice::posterior`].
    pub post: i32,
    alpha: i32,
    beta: i32,
}

#[derive(Debug)]
pub struct Lattice {
    pub nodes: Vec<LatNode>,
    pub links: Vec<LatLink>,
    /// Virtual start node id (utterance begin).
    pub start: u32,
    /// Node ids whose word occurrence ended the utterance.
    pub ends: Vec<u32>,
    norm: i32,
}

impl Lattice {
    /// Fold a finished utterance's history into a DAG. `finals` are the history entry ids that
    /// legitimately end the utterance (final frame, final grammar state).
    pub fn build(history: &History, dict: &Dict, finals: &[i32]) -> Self {
        // The virtual start node anchors words with no predecessor.
        let mut nodes = vec![LatNode {
            wid: u32::MAX,
            word: "<start>".into(),
            sf: -1,
            exits: Vec::new(),
            entries: Vec::new(),
        }];
        let mut links: Vec<LatLink> = Vec::new();
        let mut node_ids: BTreeMap<(WordId, i32), u32> = BTreeMap::new();
        // One lattice node per (word, start frame); one link per history entry.
        let mut entry_node: Vec<u32> = Vec::with_capacity(history.len());
        for (_, e) in history.iter() {
            let sf = if e.prev == NO_HIST {
                0
            } else {
                history.entry(e.prev).frame + 1
            };
            let id = *node_ids.entry((e.wid, sf)).or_insert_with(|| {
                nodes.push(LatNode {
                    wid: e.wid,
                    word: dict.word(e.wid).text().to_string(),
                    sf,
                    exits: Vec::new(),
                    entries: Vec::new(),
                });
                nodes.len() as u32 - 1
            });
            entry_node.push(id);
        }
        for (eid, e) in history.iter() {
            let to = entry_node[eid as usize];
            let from = if e.prev == NO_HIST {
                0
            } else {
                entry_node[e.prev as usize]
            };
            let prev_score = if e.prev == NO_HIST {
                0
            } else {
                history.entry(e.prev).score
            };
            let link = LatLink {
                from,
                to,
                ef: e.frame,
                ascr: e.score - prev_score - e.lscr,
                lscr: e.lscr,
                post: WORST_SCORE,
                alpha: WORST_SCORE,
                beta: WORST_SCORE,
            };
            let lid = links.len() as u32;
            nodes[from as usize].exits.push(lid);
            nodes[to as usize].entries.push(lid);
            links.push(link);
        }
        let mut ends: Vec<u32> = finals
            .iter()
            .map(|&f| entry_node[f as usize])
            .collect();
        ends.sort_unstable();
        ends.dedup();
        debug!(
            nodes = nodes.len(),
            links = links.len(),
            ends = ends.len(),
            "lattice built"
        );
        Self {
            nodes,
            links,
            start: 0,
            ends,
            norm: 0,
        }
    }

    /// Link ids in topological order (by end frame; ties don't matter since a link's
    /// predecessors always end strictly earlier).
    fn topo_links(&self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.links.len() as u32).collect();
        order.sort_by_key(|&l| self.links[l as usize].ef);
        order
    }

    /// Best path through the lattice under a (possibly new) language weight; returns the word
    /// sequence and its score. This is the `bestpath` second pass.
    pub fn bestpath(&self, lw_ratio: f32) -> (Vec<String>, i32) {
        let mut best_in: Vec<(i32, i32)> = vec![(WORST_SCORE, -1); self.links.len()];
        let order = self.topo_links();
        let mut final_best: (i32, i32) = (WORST_SCORE, -1);
        for &lid in &order {
            let link = &self.links[lid as usize];
            let incoming = if link.from == self.start {
                0
            } else {
                self.nodes[link.from as usize]
                    .entries
                    .iter()
                    .map(|&p| best_in[p as usize].0)
                    .max()
                    .unwrap_or(WORST_SCORE)
            };
            if incoming <= WORST_SCORE {
                continue;
            }
            let lscr = (link.lscr as f64 * lw_ratio as f64) as i32;
            let score = incoming + link.ascr + lscr;
            let prev = if link.from == self.start {
                -1
            } else {
                self.nodes[link.from as usize]
                    .entries
                    .iter()
                    .copied()
                    .max_by_key(|&p| best_in[p as usize].0)
                    .map(|p| p as i32)
                    .unwrap_or(-1)
            };
            best_in[lid as usize] = (score, prev);
            if self.ends.contains(&link.to) && score > final_best.0 {
                final_best = (score, lid as i32);
            }
        }
        let mut words = Vec::new();
        let mut cur = final_best.1;
        while cur >= 0 {
            let link = &self.links[cur as usize];
            words.push(self.nodes[link.to as usize].word.clone());
            cur = best_in[cur as usize].1;
        }
        words.reverse();
        (words, final_best.0)
    }

    /// Forward/backward posteriors in the log semiring. Returns the total path likelihood
    /// (the normalizer); each link's `post` is filled in.
    pub fn posterior(&mut self, lmath: &LogMath, ascale: f32) -> i32 {
        let scaled = |l: &LatLink| (l.ascr as f64 / ascale as f64) as i32 + l.lscr;
        let order = self.topo_links();

        for &lid in &order {
            let link = &self.links[lid as usize];
            let own = scaled(link);
            let alpha = if link.from == self.start {
                own
            } else {
                let mut acc = WORST_SCORE;
                for &p in &self.nodes[link.from as usize].entries {
                    acc = lmath.add(acc, self.links[p as usize].alpha);
                }
                if acc <= WORST_SCORE {
                    WORST_SCORE
                } else {
                    acc + own
                }
            };
            self.links[lid as usize].alpha = alpha;
        }

        let mut norm = WORST_SCORE;
        for &end in &self.ends {
            for &l in &self.nodes[end as usize].entries {
                norm = lmath.add(norm, self.links[l as usize].alpha);
            }
        }

        for &lid in order.iter().rev() {
            let link = &self.links[lid as usize];
            let beta = if self.ends.contains(&link.to) {
                0
            } else {
                let mut acc = WORST_SCORE;
                for &n in &self.nodes[link.to as usize].exits {
                    let next = &self.links[n as usize];
                    let v = next.beta;
                    if v <= WORST_SCORE {
                        continue;
                    }
                    acc = lmath.add(acc, v + scaled(next));
                }
                acc
            };
            self.links[lid as usize].beta = beta;
        }

        for l in &mut self.links {
            if l.alpha > WORST_SCORE && l.beta > WORST_SCORE && norm > WORST_SCORE {
                l.post = l.alpha + l.beta - norm;
            }
        }
        self.norm = norm;
        norm
    }

    /// Posterior of the best final link: what `get_prob` reports.
    pub fn best_posterior(&self) -> i32 {
        self.ends
            .iter()
            .flat_map(|&e| self.nodes[e as usize].entries.iter())
            .map(|&l| self.links[l as usize].post)
            .max()
            .unwrap_or(0)
            .min(0)
    }

    /// True if every link points forward in time; the DAG invariant.
    pub fn is_acyclic(&self) -> bool {
        self.links
            .iter()
            .all(|l| self.nodes[l.to as usize].sf > self.nodes[l.from as usize].sf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acmod::mdef::tests::toy_mdef;
    use crate::fsg::history::HistEntry;
    use crate::fsg::lextree::PhoneSet;
    use std::sync::Arc;

    fn dict() -> Dict {
        let mut d = Dict::new(Arc::new(toy_mdef())).unwrap();
        d.add_word_str("a", &["AX"], false).unwrap();
        d.add_word_str("b", &["B"], false).unwrap();
        d
    }

    fn entry(wid: WordId, frame: i32, prev: i32, score: i32) -> HistEntry {
        HistEntry {
            score,
            frame,
            arc: 0,
            wid,
            last_ci: 0,
            prev,
            lscr: -2,
            rc_mask: PhoneSet::full(3),
        }
    }

    /// Two competing paths: "a b" and "b b", sharing the final word occurrence timing.
    fn history(d: &Dict) -> (History, Vec<i32>) {
        let a = d.wordid("a").unwrap();
        let b = d.wordid("b").unwrap();
        let mut h = History::new();
        h.start_frame(0);
        h.start_frame(1);
        let e0 = h.push(entry(a, 1, NO_HIST, -100));
        let e1 = h.push(entry(b, 1, NO_HIST, -120));
        h.start_frame(2);
        h.start_frame(3);
        let e2 = h.push(entry(b, 3, e0, -200));
        let e3 = h.push(entry(b, 3, e1, -260));
        (h, vec![e2, e3])
    }

    #[test]
    fn builds_a_dag_with_merged_nodes() {
        let d = dict();
        let (h, finals) = history(&d);
        let lat = Lattice::build(&h, &d, &finals);
        // start + a@0 + b@0 + b@2 (the two finals merge into one node).
        assert_eq!(lat.nodes.len(), 4);
        assert_eq!(lat.links.len(), 4);
        assert!(lat.is_acyclic());
        // The two final entries share a (word, start frame) node.
        assert_eq!(lat.ends.len(), 1);
    }

    #[test]
    fn bestpath_picks_higher_scoring_route() {
        let d = dict();
        let (h, finals) = history(&d);
        let lat = Lattice::build(&h, &d, &finals);
        let (words, score) = lat.bestpath(1.0);
        assert_eq!(words, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(score, -200);
    }

    #[test]
    fn posteriors_normalize_and_prefer_best_path() {
        let d = dict();
        let (h, finals) = history(&d);
        let mut lat = Lattice::build(&h, &d, &finals);
        let lmath = LogMath::new(1.0001, 0).unwrap();
        lat.posterior(&lmath, 1.0);
        let post = lat.best_posterior();
        // Log posterior of the dominant path: near zero, never positive.
        assert!(post <= 0);
        assert!(post > -100000);
        // The two final links' posteriors must sum to ~1.
        let total: f64 = lat
            .ends
            .iter()
            .flat_map(|&e| lat.nodes[e as usize].entries.iter())
            .map(|&l| lmath.exp(lat.links[l as usize].post))
            .sum();
        assert!((total - 1.0).abs() < 0.05, "posterior mass {total}");
    }
}
