//! Single-HMM Viterbi update. Each search node owns one of these: a score per emitting state,
//! the history (backpointer arena id) riding along with the best path into each state, and the
//! exit score feeding phone and word transitions.
//!
//! The update is in-place over the state vector, walking destinations from last to first. That
//! is only sound for left-to-right topologies (no backward transitions), which the transition
//! matrix loader enforces.
use crate::acmod::tmat::Tmat;
use crate::logmath::WORST_SCORE;

/// History value meaning "no backpointer yet".
pub const NO_HIST: i32 = -1;

#[derive(Debug, Clone)]
pub struct Hmm {
    score: Vec<i32>,
    hist: Vec<i32>,
    out_score: i32,
    out_hist: i32,
    bestscore: i32,
    /// Last frame this HMM was entered or evaluated in; the search uses it as its active mark.
    pub frame: i32,
}

impl Hmm {
    pub fn new(n_state: usize) -> Self {
        Self {
            score: vec![WORST_SCORE; n_state],
            hist: vec![NO_HIST; n_state],
            out_score: WORST_SCORE,
            out_hist: NO_HIST,
            bestscore: WORST_SCORE,
            frame: -1,
        }
    }

    pub fn clear(&mut self) {
        self.score.fill(WORST_SCORE);
        self.hist.fill(NO_HIST);
        self.out_score = WORST_SCORE;
        self.out_hist = NO_HIST;
        self.bestscore = WORST_SCORE;
        self.frame = -1;
    }

    /// Offer an entry into state 0. Keeps the better of the existing and offered path.
    pub fn enter(&mut self, score: i32, hist: i32, frame: i32) {
        if score > self.score[0] {
            self.score[0] = score;
            self.hist[0] = hist;
        }
        self.frame = frame;
    }

    pub fn bestscore(&self) -> i32 {
        self.bestscore
    }

    pub fn out_score(&self) -> i32 {
        self.out_score
    }

    pub fn out_hist(&self) -> i32 {
        self.out_hist
    }

    pub fn state_score(&self, s: usize) -> i32 {
        self.score[s]
    }

    /// One frame of Viterbi: transition probabilities from `tmat` matrix `tmatid`, emission
    /// scores looked up through the senone sequence `sseq` in `senscr`. Returns the new best
    /// state score.
    pub fn eval(&mut self, tmat: &Tmat, tmatid: u32, sseq: &[u16], senscr: &[i32]) -> i32 {
        let n = self.score.len();
        debug_assert_eq!(sseq.len(), n);

        self.bestscore = WORST_SCORE;
        for j in (0..n).rev() {
            let mut best = WORST_SCORE;
            let mut best_hist = NO_HIST;
            for i in 0..=j {
                if self.score[i] <= WORST_SCORE {
                    continue;
                }
                let tp = tmat.prob(tmatid, i, j);
                if tp <= WORST_SCORE {
                    continue;
                }
                let s = self.score[i] + tp;
                if s > best {
                    best = s;
                    best_hist = self.hist[i];
                }
            }
            let emit = senscr[sseq[j] as usize];
            let new = if best <= WORST_SCORE || emit <= WORST_SCORE {
                WORST_SCORE
            } else {
                best + emit
            };
            self.score[j] = new;
            self.hist[j] = best_hist;
            if new > self.bestscore {
                self.bestscore = new;
            }
        }

        // Exit state: non-emitting, fed by this frame's updated scores so a transition out
        // carries the current frame's emission with it.
        self.out_score = WORST_SCORE;
        self.out_hist = NO_HIST;
        for i in 0..n {
            if self.score[i] <= WORST_SCORE {
                continue;
            }
            let tp = tmat.prob(tmatid, i, n);
            if tp <= WORST_SCORE {
                continue;
            }
            let s = self.score[i] + tp;
            if s > self.out_score {
                self.out_score = s;
                self.out_hist = self.hist[i];
            }
        }
        self.bestscore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acmod::tmat::tests::toy_tmat;
    use crate::logmath::LogMath;

    fn setup() -> (LogMath, Tmat) {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let tm = toy_tmat(&lmath, 1);
        (lmath, tm)
    }

    #[test]
    fn entry_then_eval_advances() {
        let (_lmath, tm) = setup();
        let mut hmm = Hmm::new(3);
        hmm.enter(0, 7, 0);
        let senscr = vec![-10i32; 4];
        let sseq = [0u16, 1, 2];

        let best = hmm.eval(&tm, 0, &sseq, &senscr);
        assert!(best > WORST_SCORE);
        // Only state 0 was seeded so only states reachable from it in one hop are alive.
        assert!(hmm.state_score(0) > WORST_SCORE);
        assert!(hmm.state_score(1) > WORST_SCORE);
        assert!(hmm.state_score(2) > WORST_SCORE); // skip arc 0 -> 2 exists
        // History rides the best path.
        assert_eq!(hmm.hist[0], 7);
        assert_eq!(hmm.hist[1], 7);

        // The exit becomes reachable once state mass arrives near the end.
        let mut out_seen = hmm.out_score() > WORST_SCORE;
        for _ in 0..3 {
            hmm.eval(&tm, 0, &sseq, &senscr);
            out_seen |= hmm.out_score() > WORST_SCORE;
        }
        assert!(out_seen);
        assert_eq!(hmm.out_hist(), 7);
    }

    #[test]
    fn better_entry_wins() {
        let (_lmath, tm) = setup();
        let mut hmm = Hmm::new(3);
        hmm.enter(-100, 1, 0);
        hmm.enter(-50, 2, 0);
        hmm.enter(-80, 3, 0);
        let senscr = vec![0i32; 3];
        hmm.eval(&tm, 0, &[0, 1, 2], &senscr);
        assert_eq!(hmm.hist[0], 2);
    }

    #[test]
    fn empty_hmm_stays_dead() {
        let (_lmath, tm) = setup();
        let mut hmm = Hmm::new(3);
        let senscr = vec![0i32; 3];
        let best = hmm.eval(&tm, 0, &[0, 1, 2], &senscr);
        assert_eq!(best, WORST_SCORE);
        assert_eq!(hmm.out_score(), WORST_SCORE);
    }

    #[test]
    fn worst_emission_kills_state() {
        let (_lmath, tm) = setup();
        let mut hmm = Hmm::new(3);
        hmm.enter(0, 0, 0);
        let senscr = vec![WORST_SCORE; 3];
        let best = hmm.eval(&tm, 0, &[0, 1, 2], &senscr);
        assert_eq!(best, WORST_SCORE);
    }
}
