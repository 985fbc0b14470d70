//! Viterbi word history: an append-only arena of word-exit entries. Every entry is a
//! backpointer into the arena (or -1 at the root), so a hypothesis is just a walk from the best
//! final entry back to the sentinel. Per-frame base indices let the search iterate "entries
//! created this frame" when doing word transitions, and a checkpoint is nothing more than a
//! length.
use crate::acmod::mdef::CiPhoneId;
use crate::dict::WordId;
use crate::fsg::lextree::PhoneSet;

pub const NO_HIST: i32 = -1;

#[derive(Debug, Clone)]
pub struct HistEntry {
    /// Normalized path score up to and including this word's exit.
    pub score: i32,
    /// Frame at which the word ended.
    pub frame: i32,
    /// Grammar arc the word was recognized on.
    pub arc: u32,
    pub wid: WordId,
    /// Final phone of the word, the left context for whatever follows.
    pub last_ci: CiPhoneId,
    /// Previous entry in the arena, or [`NO_HIST`].
    pub prev: i32,
    /// Language score component attributed to this word.
    pub lscr: i32,
    /// Right contexts this exit is valid for; a following word's first phone must be in here.
    pub rc_mask: PhoneSet,
}

#[derive(Debug, Default)]
pub struct History {
    entries: Vec<HistEntry>,
    /// First entry index belonging to each frame.
    frame_base: Vec<usize>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.frame_base.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark the start of a frame's entries. Must be called once per frame, in order.
    pub fn start_frame(&mut self, frame: i32) {
        debug_assert_eq!(self.frame_base.len(), frame as usize);
        self.frame_base.push(self.entries.len());
    }

    pub fn push(&mut self, entry: HistEntry) -> i32 {
        let id = self.entries.len() as i32;
        self.entries.push(entry);
        id
    }

    pub fn entry(&self, id: i32) -> &HistEntry {
        &self.entries[id as usize]
    }

    /// Entries created during `frame`, with their ids.
    pub fn frame_entries(&self, frame: i32) -> impl Iterator<Item = (i32, &HistEntry)> {
        let start = self.frame_base[frame as usize];
        let end = self
            .frame_base
            .get(frame as usize + 1)
            .copied()
            .unwrap_or(self.entries.len());
        (start..end).map(move |i| (i as i32, &self.entries[i]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &HistEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i as i32, e))
    }

    /// Walk the backpointer chain from `id` to the root, returning entry ids oldest first.
    pub fn backtrace(&self, mut id: i32) -> Vec<i32> {
        let mut out = Vec::new();
        while id != NO_HIST {
            out.push(id);
            id = self.entries[id as usize].prev;
        }
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(frame: i32, prev: i32, score: i32) -> HistEntry {
        HistEntry {
            score,
            frame,
            arc: 0,
            wid: 0,
            last_ci: 0,
            prev,
            lscr: 0,
            rc_mask: PhoneSet::full(4),
        }
    }

    #[test]
    fn backtrace_walks_to_sentinel() {
        let mut h = History::new();
        h.start_frame(0);
        let a = h.push(entry(0, NO_HIST, -10));
        h.start_frame(1);
        let b = h.push(entry(1, a, -20));
        h.start_frame(2);
        let c = h.push(entry(2, b, -30));
        assert_eq!(h.backtrace(c), vec![a, b, c]);
        assert_eq!(h.backtrace(NO_HIST), Vec::<i32>::new());
    }

    #[test]
    fn frame_entries_are_bracketed() {
        let mut h = History::new();
        h.start_frame(0);
        h.push(entry(0, NO_HIST, -1));
        h.push(entry(0, NO_HIST, -2));
        h.start_frame(1);
        h.start_frame(2);
        h.push(entry(2, 0, -3));
        assert_eq!(h.frame_entries(0).count(), 2);
        assert_eq!(h.frame_entries(1).count(), 0);
        assert_eq!(h.frame_entries(2).count(), 1);
    }
}
