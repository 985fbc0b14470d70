//! Finite-state grammar model: states, arcs carrying words and log probabilities, and the
//! epsilon closure the search uses to hop across null transitions in one step. Immutable once
//! built.
//!
//! Three ways to get one: parse the text FSG format, wire one up programmatically (the JSGF
//! compiler and the forced-alignment builder do this), or the keyphrase convenience builder.
use crate::error::{Error, Result};
use crate::logmath::LogMath;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Index into the grammar's own vocabulary. The lextree resolves these against the dictionary.
pub type FsgWordId = u32;

#[derive(Debug, Clone)]
pub struct FsgArc {
    pub from: u32,
    pub to: u32,
    /// `None` for an epsilon (null) transition.
    pub word: Option<FsgWordId>,
    /// Raw grammar log probability (language weight not yet applied).
    pub logprob: i32,
}

#[derive(Debug)]
pub struct FsgModel {
    name: String,
    n_state: u32,
    start_state: u32,
    final_state: u32,
    vocab: Vec<String>,
    vocab_map: BTreeMap<String, FsgWordId>,
    arcs: Vec<FsgArc>,
    /// Word-bearing arcs leaving each state.
    out_arcs: Vec<Vec<u32>>,
    /// Epsilon closure per state: `(state, accumulated logprob)`, self included at zero.
    closure: Vec<Vec<(u32, i32)>>,
}

pub struct FsgBuilder {
    name: String,
    n_state: u32,
    start_state: u32,
    final_state: u32,
    vocab: Vec<String>,
    vocab_map: BTreeMap<String, FsgWordId>,
    arcs: Vec<FsgArc>,
    lmath: Arc<LogMath>,
}

impl FsgBuilder {
    pub fn new(
        name: impl Into<String>,
        n_state: u32,
        start_state: u32,
        final_state: u32,
        lmath: Arc<LogMath>,
    ) -> Self {
        Self {
            name: name.into(),
            n_state,
            start_state,
            final_state,
            vocab: Vec::new(),
            vocab_map: BTreeMap::new(),
            arcs: Vec::new(),
            lmath,
        }
    }

    pub fn word_id(&mut self, word: &str) -> FsgWordId {
        match self.vocab_map.get(word) {
            Some(&id) => id,
            None => {
                let id = self.vocab.len() as FsgWordId;
                self.vocab.push(word.to_string());
                self.vocab_map.insert(word.to_string(), id);
                id
            }
        }
    }

    pub fn add_arc(&mut self, from: u32, to: u32, word: &str, prob: f64) {
        let wid = self.word_id(word);
        let logprob = self.lmath.log(prob);
        self.arcs.push(FsgArc {
            from,
            to,
            word: Some(wid),
            logprob,
        });
    }

    pub fn add_eps(&mut self, from: u32, to: u32, prob: f64) {
        let logprob = self.lmath.log(prob);
        self.arcs.push(FsgArc {
            from,
            to,
            word: None,
            logprob,
        });
    }

    /// Allocate a fresh state (for programmatic construction).
    pub fn new_state(&mut self) -> u32 {
        self.n_state += 1;
        self.n_state - 1
    }

    pub fn set_final(&mut self, state: u32) {
        self.final_state = state;
    }

    pub fn build(self) -> Result<FsgModel> {
        if self.start_state >= self.n_state || self.final_state >= self.n_state {
            return Err(Error::parse(
                0,
                format!(
                    "start {} / final {} out of range for {} states",
                    self.start_state, self.final_state, self.n_state
                ),
            ));
        }
        for arc in &self.arcs {
            if arc.from >= self.n_state || arc.to >= self.n_state {
                return Err(Error::parse(
                    0,
                    format!("arc {} -> {} out of range", arc.from, arc.to),
                ));
            }
        }

        let n = self.n_state as usize;
        let mut out_arcs = vec![Vec::new(); n];
        for (i, arc) in self.arcs.iter().enumerate() {
            if arc.word.is_some() {
                out_arcs[arc.from as usize].push(i as u32);
            }
        }

        // Epsilon closure by relaxation; grammars are small so the simple quadratic pass is
        // fine. Keeps the best accumulated probability per reachable state.
        let mut closure: Vec<Vec<(u32, i32)>> = Vec::with_capacity(n);
        for s in 0..n as u32 {
            let mut best: BTreeMap<u32, i32> = BTreeMap::new();
            best.insert(s, 0);
            let mut stack = vec![s];
            while let Some(cur) = stack.pop() {
                let cur_lp = best[&cur];
                for arc in self.arcs.iter().filter(|a| a.from == cur && a.word.is_none()) {
                    let lp = cur_lp + arc.logprob;
                    let better = best.get(&arc.to).map_or(true, |&old| lp > old);
                    if better {
                        best.insert(arc.to, lp);
                        stack.push(arc.to);
                    }
                }
            }
            closure.push(best.into_iter().collect());
        }

        let model = FsgModel {
            name: self.name,
            n_state: self.n_state,
            start_state: self.start_state,
            final_state: self.final_state,
            vocab: self.vocab,
            vocab_map: self.vocab_map,
            arcs: self.arcs,
            out_arcs,
            closure,
        };
        if !model.final_reachable() {
            return Err(Error::parse(
                0,
                format!("final state {} unreachable from start", model.final_state),
            ));
        }
        Ok(model)
    }
}

impl FsgModel {
    /// Parse the text FSG format: `FSG_BEGIN name`, `NUM_STATES`/`N`, `START_STATE`/`S`,
    /// `FINAL_STATE`/`F`, `TRANSITION`/`T from to prob [word]`, `FSG_END`, `#` comments.
    pub fn parse(reader: impl BufRead, lmath: Arc<LogMath>) -> Result<Self> {
        let mut name = String::new();
        let mut n_state: Option<u32> = None;
        let mut start: Option<u32> = None;
        let mut fin: Option<u32> = None;
        let mut transitions: Vec<(u32, u32, f64, Option<String>, usize)> = Vec::new();
        let mut seen_end = false;

        for (no, line) in reader.lines().enumerate() {
            let no = no + 1;
            let line = line?;
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => &line[..],
            };
            let toks: Vec<&str> = line.split_whitespace().collect();
            if toks.is_empty() {
                continue;
            }
            let parse_u32 = |s: &str| -> Result<u32> {
                s.parse()
                    .map_err(|_| Error::parse(no, format!("bad state number {s:?}")))
            };
            match toks[0] {
                "FSG_BEGIN" => {
                    name = toks.get(1).copied().unwrap_or("").to_string();
                }
                "FSG_END" => {
                    seen_end = true;
                    break;
                }
                "NUM_STATES" | "N" => {
                    let v = toks
                        .get(1)
                        .ok_or_else(|| Error::parse(no, "NUM_STATES needs a value"))?;
                    n_state = Some(parse_u32(v)?);
                }
                "START_STATE" | "S" => {
                    let v = toks
                        .get(1)
                        .ok_or_else(|| Error::parse(no, "START_STATE needs a value"))?;
                    start = Some(parse_u32(v)?);
                }
                "FINAL_STATE" | "F" => {
                    let v = toks
                        .get(1)
                        .ok_or_else(|| Error::parse(no, "FINAL_STATE needs a value"))?;
                    fin = Some(parse_u32(v)?);
                }
                "TRANSITION" | "T" => {
                    if toks.len() < 4 {
                        return Err(Error::parse(no, "TRANSITION needs from, to, prob"));
                    }
                    let from = parse_u32(toks[1])?;
                    let to = parse_u32(toks[2])?;
                    let prob: f64 = toks[3]
                        .parse()
                        .map_err(|_| Error::parse(no, format!("bad probability {:?}", toks[3])))?;
                    if !(prob > 0.0 && prob <= 1.0) {
                        return Err(Error::parse(no, format!("probability {prob} out of range")));
                    }
                    let word = toks.get(4).map(|w| w.to_string());
                    transitions.push((from, to, prob, word, no));
                }
                other => {
                    return Err(Error::parse(no, format!("unknown directive {other:?}")));
                }
            }
        }
        if !seen_end {
            return Err(Error::parse(0, "missing FSG_END"));
        }
        let n_state = n_state.ok_or_else(|| Error::parse(0, "missing NUM_STATES"))?;
        let start = start.ok_or_else(|| Error::parse(0, "missing START_STATE"))?;
        let fin = fin.ok_or_else(|| Error::parse(0, "missing FINAL_STATE"))?;

        let mut b = FsgBuilder::new(name, n_state, start, fin, lmath);
        for (from, to, prob, word, _no) in transitions {
            match word {
                Some(w) => b.add_arc(from, to, &w, prob),
                None => b.add_eps(from, to, prob),
            }
        }
        let model = b.build()?;
        info!(
            name = %model.name,
            states = model.n_state,
            arcs = model.arcs.len(),
            "grammar parsed"
        );
        Ok(model)
    }

    pub fn parse_file(path: impl AsRef<Path>, lmath: Arc<LogMath>) -> Result<Self> {
        let file = fs::File::open(path.as_ref())?;
        Self::parse(io::BufReader::new(file), lmath)
    }

    /// A linear grammar for a keyphrase: the phrase words in sequence, with silence loops on
    /// every state so surrounding audio doesn't have to match anything.
    pub fn keyphrase(phrase: &str, lmath: Arc<LogMath>) -> Result<Self> {
        let words: Vec<&str> = phrase.split_whitespace().collect();
        if words.is_empty() {
            return Err(Error::parse(0, "empty keyphrase"));
        }
        let n_state = words.len() as u32 + 1;
        let mut b = FsgBuilder::new(phrase, n_state, 0, n_state - 1, lmath);
        for (i, w) in words.iter().enumerate() {
            b.add_arc(i as u32, i as u32 + 1, w, 1.0);
        }
        for s in 0..n_state {
            b.add_arc(s, s, "<sil>", 0.1);
        }
        b.build()
    }

    /// A forced-alignment grammar: each word an arc in sequence, with optional `<sil>` before,
    /// between and after.
    pub fn align_text(words: &[&str], lmath: Arc<LogMath>) -> Result<Self> {
        if words.is_empty() {
            return Err(Error::parse(0, "empty alignment text"));
        }
        // States 0..=n word positions, plus one silence state per gap.
        let n_gaps = words.len() as u32 + 1;
        let n_state = (words.len() as u32 + 1) + n_gaps;
        let mut b = FsgBuilder::new("align", n_state, 0, words.len() as u32, lmath);
        let sil_state = |gap: u32| words.len() as u32 + 1 + gap;
        for (i, w) in words.iter().enumerate() {
            let i = i as u32;
            b.add_arc(i, i + 1, w, 1.0);
            // Optional silence in the gap before this word.
            b.add_arc(i, sil_state(i), "<sil>", 0.5);
            b.add_eps(sil_state(i), i, 1.0);
        }
        // Trailing silence.
        let last = words.len() as u32;
        b.add_arc(last, sil_state(last), "<sil>", 0.5);
        b.add_eps(sil_state(last), last, 1.0);
        b.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_state(&self) -> u32 {
        self.n_state
    }

    pub fn start_state(&self) -> u32 {
        self.start_state
    }

    pub fn final_state(&self) -> u32 {
        self.final_state
    }

    pub fn arcs(&self) -> &[FsgArc] {
        &self.arcs
    }

    pub fn arc(&self, id: u32) -> &FsgArc {
        &self.arcs[id as usize]
    }

    /// Ids of word-bearing arcs out of `state`.
    pub fn out_arcs(&self, state: u32) -> &[u32] {
        &self.out_arcs[state as usize]
    }

    pub fn closure(&self, state: u32) -> &[(u32, i32)] {
        &self.closure[state as usize]
    }

    pub fn word_str(&self, wid: FsgWordId) -> &str {
        &self.vocab[wid as usize]
    }

    pub fn n_words(&self) -> usize {
        self.vocab.len()
    }

    /// Whether `state`'s epsilon closure contains the final state.
    pub fn reaches_final(&self, state: u32) -> bool {
        self.closure[state as usize]
            .iter()
            .any(|&(s, _)| s == self.final_state)
    }

    fn final_reachable(&self) -> bool {
        let mut seen = vec![false; self.n_state as usize];
        let mut stack = vec![self.start_state];
        seen[self.start_state as usize] = true;
        while let Some(s) = stack.pop() {
            if s == self.final_state {
                return true;
            }
            for arc in self.arcs.iter().filter(|a| a.from == s) {
                if !seen[arc.to as usize] {
                    seen[arc.to as usize] = true;
                    stack.push(arc.to);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lmath() -> Arc<LogMath> {
        Arc::new(LogMath::new(1.0001, 0).unwrap())
    }

    const GOFORWARD: &str = "\
FSG_BEGIN move
NUM_STATES 5
START_STATE 0
FINAL_STATE 4
# go forward ten meters
T 0 1 0.5 go
T 1 2 1.0 forward
T 2 3 0.5 ten
T 2 3 0.5 twenty
T 3 4 1.0 meters
FSG_END
";

    #[test]
    fn parses_text_format() {
        let fsg = FsgModel::parse(Cursor::new(GOFORWARD), lmath()).unwrap();
        assert_eq!(fsg.name(), "move");
        assert_eq!(fsg.n_state(), 5);
        assert_eq!(fsg.start_state(), 0);
        assert_eq!(fsg.final_state(), 4);
        assert_eq!(fsg.n_words(), 5);
        assert_eq!(fsg.out_arcs(2).len(), 2);
        assert!(fsg.reaches_final(4));
        assert!(!fsg.reaches_final(0));
    }

    #[test]
    fn rejects_malformed_grammars() {
        let no_end = "FSG_BEGIN x\nNUM_STATES 2\nSTART_STATE 0\nFINAL_STATE 1\n";
        assert!(FsgModel::parse(Cursor::new(no_end), lmath()).is_err());

        let bad_state = GOFORWARD.replace("T 3 4 1.0 meters", "T 3 9 1.0 meters");
        assert!(FsgModel::parse(Cursor::new(bad_state), lmath()).is_err());

        let bad_prob = GOFORWARD.replace("T 0 1 0.5 go", "T 0 1 1.5 go");
        assert!(FsgModel::parse(Cursor::new(bad_prob), lmath()).is_err());

        // Final state exists but nothing leads to it.
        let orphan = "\
FSG_BEGIN x
NUM_STATES 3
START_STATE 0
FINAL_STATE 2
T 0 1 1.0 word
FSG_END
";
        assert!(FsgModel::parse(Cursor::new(orphan), lmath()).is_err());
    }

    #[test]
    fn epsilon_closure_accumulates_best_probability() {
        let lm = lmath();
        let mut b = FsgBuilder::new("eps", 4, 0, 3, lm.clone());
        b.add_arc(0, 1, "w", 1.0);
        b.add_eps(1, 2, 0.5);
        b.add_eps(2, 3, 0.5);
        b.add_eps(1, 3, 0.1); // worse direct path
        let fsg = b.build().unwrap();
        let cl = fsg.closure(1);
        assert_eq!(cl.len(), 3);
        let lp3 = cl.iter().find(|&&(s, _)| s == 3).unwrap().1;
        // Best path is 0.5 * 0.5 = 0.25, not the direct 0.1.
        assert!((lm.exp(lp3) - 0.25).abs() < 1e-3);
        assert!(fsg.reaches_final(1));
    }

    #[test]
    fn keyphrase_grammar_shape() {
        let fsg = FsgModel::keyphrase("go forward", lmath()).unwrap();
        assert_eq!(fsg.n_state(), 3);
        // Each state: outgoing word arc (except final) plus a silence self-loop.
        assert_eq!(fsg.out_arcs(0).len(), 2);
        assert_eq!(fsg.out_arcs(2).len(), 1);
        assert!(fsg.reaches_final(2));
    }

    #[test]
    fn align_grammar_optional_silence() {
        let fsg = FsgModel::align_text(&["he", "was"], lmath()).unwrap();
        // Word path 0 -> 1 -> 2, final 2, with silence detours in each gap.
        assert_eq!(fsg.final_state(), 2);
        // Gap silences: from each word state one <sil> arc plus the word arc.
        assert_eq!(fsg.out_arcs(0).len(), 2);
        assert_eq!(fsg.out_arcs(2).len(), 1); // only trailing <sil>
        assert!(fsg.reaches_final(2));
        // Silence state closure leads back to the word state.
        let sil0 = 3;
        assert!(fsg.closure(sil0).iter().any(|&(s, _)| s == 0));
    }
}
