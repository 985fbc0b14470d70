//! Pronunciation dictionary. A fairly simple map from word to phone sequence, with the two
//! properties the search cares about baked in: word ids are stable for the life of the decoder
//! (they index straight into search arenas), and the three magic words `<s>`, `</s>` and
//! `<sil>` always exist, all pronounced as the silence phone.
//!
//! The file format is one entry per line, `WORD PH PH PH...`, with `;;`-style comment lines
//! skipped and alternate pronunciations written as `WORD(2)`. Lookup folds ASCII case so
//! grammars can spell words however they like; the stored headword keeps its source spelling.
use crate::acmod::mdef::{CiPhoneId, Mdef};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub type WordId = u32;

pub type Pronunciation = Vec<CiPhoneId>;

#[derive(Debug, Clone)]
pub struct Word {
    text: String,
    phones: Pronunciation,
    filler: bool,
}

impl Word {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn phones(&self) -> &[CiPhoneId] {
        &self.phones
    }

    pub fn is_filler(&self) -> bool {
        self.filler
    }
}

#[derive(Debug)]
pub struct Dict {
    mdef: Arc<Mdef>,
    words: Vec<Word>,
    /// Case-folded headword -> id of the first (primary) pronunciation.
    index: BTreeMap<String, WordId>,
    silence_ci: CiPhoneId,
    start_wid: WordId,
    finish_wid: WordId,
    silence_wid: WordId,
}

fn fold(word: &str) -> String {
    word.to_ascii_uppercase()
}

/// Strip an alternate-pronunciation suffix: `FORWARD(2)` -> `FORWARD`.
fn strip_alt(word: &str) -> &str {
    match word.find('(') {
        Some(i) if word.ends_with(')') => &word[..i],
        _ => word,
    }
}

impl Dict {
    /// Create a dictionary holding only the magic words. `SIL` must exist in the model.
    pub fn new(mdef: Arc<Mdef>) -> Result<Self> {
        let silence_ci = mdef
            .ciphone_id("SIL")
            .ok_or_else(|| Error::InvalidConfig("model has no SIL phone".into()))?;
        let mut dict = Self {
            mdef,
            words: Vec::new(),
            index: BTreeMap::new(),
            silence_ci,
            start_wid: 0,
            finish_wid: 0,
            silence_wid: 0,
        };
        dict.start_wid = dict.insert("<s>", vec![silence_ci], true);
        dict.finish_wid = dict.insert("</s>", vec![silence_ci], true);
        dict.silence_wid = dict.insert("<sil>", vec![silence_ci], true);
        Ok(dict)
    }

    /// Load the main dictionary, and optionally a filler dictionary whose words are marked as
    /// non-events for the search.
    pub fn load(
        mdef: Arc<Mdef>,
        main: Option<&Path>,
        filler: Option<&Path>,
    ) -> Result<Self> {
        let mut dict = Self::new(mdef)?;
        if let Some(path) = main {
            let file = fs::File::open(path)?;
            dict.read_entries(io::BufReader::new(file), false)?;
        }
        if let Some(path) = filler {
            let file = fs::File::open(path)?;
            dict.read_entries(io::BufReader::new(file), true)?;
        }
        info!(words = dict.len(), "dictionary loaded");
        Ok(dict)
    }

    /// Works from any reader so tests can use in-memory dictionaries instead of fixture files.
    pub fn read_entries(&mut self, reader: impl BufRead, filler: bool) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(";;") || line.starts_with('#') {
                continue;
            }
            let mut toks = line.split_whitespace();
            let word = toks.next().expect("non-empty line has a token");
            let phones: Vec<&str> = toks.collect();
            if phones.is_empty() {
                warn!("dictionary entry {word:?} has no phones, skipping");
                continue;
            }
            match self.add_word_str(word, &phones, filler) {
                Ok(_) => {}
                Err(Error::InvalidPhones { word, phone }) => {
                    // One bad entry shouldn't sink the whole dictionary.
                    warn!("skipping {word:?}: unknown phone {phone:?}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn insert(&mut self, text: &str, phones: Pronunciation, filler: bool) -> WordId {
        let wid = self.words.len() as WordId;
        self.index.entry(fold(strip_alt(text))).or_insert(wid);
        self.words.push(Word {
            text: text.to_string(),
            phones,
            filler,
        });
        wid
    }

    /// Add a word. Phones must all exist in the model definition; ids of existing words never
    /// move. Returns the id of the new entry.
    pub fn add_word_str(&mut self, text: &str, phones: &[&str], filler: bool) -> Result<WordId> {
        let mut pron = Vec::with_capacity(phones.len());
        for p in phones {
            let ci = self.mdef.ciphone_id(p).ok_or_else(|| Error::InvalidPhones {
                word: text.to_string(),
                phone: p.to_string(),
            })?;
            pron.push(ci);
        }
        if pron.is_empty() {
            return Err(Error::InvalidPhones {
                word: text.to_string(),
                phone: String::new(),
            });
        }
        Ok(self.insert(text, pron, filler))
    }

    pub fn wordid(&self, text: &str) -> Option<WordId> {
        self.index.get(&fold(strip_alt(text))).copied()
    }

    pub fn word(&self, wid: WordId) -> &Word {
        &self.words[wid as usize]
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn start_wid(&self) -> WordId {
        self.start_wid
    }

    pub fn finish_wid(&self) -> WordId {
        self.finish_wid
    }

    pub fn silence_wid(&self) -> WordId {
        self.silence_wid
    }

    pub fn silence_ci(&self) -> CiPhoneId {
        self.silence_ci
    }

    /// A real word is anything that isn't one of the magic/filler entries.
    pub fn real_word(&self, wid: WordId) -> bool {
        !self.words[wid as usize].filler
    }

    pub fn first_phone(&self, wid: WordId) -> CiPhoneId {
        self.words[wid as usize].phones[0]
    }

    pub fn last_phone(&self, wid: WordId) -> CiPhoneId {
        *self.words[wid as usize].phones.last().unwrap()
    }

    pub fn mdef(&self) -> &Arc<Mdef> {
        &self.mdef
    }

    pub fn iter(&self) -> impl Iterator<Item = (WordId, &Word)> {
        self.words
            .iter()
            .enumerate()
            .map(|(i, w)| (i as WordId, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acmod::mdef::tests::toy_mdef;
    use std::io::Cursor;

    fn dict() -> Dict {
        Dict::new(Arc::new(toy_mdef())).unwrap()
    }

    #[test]
    fn magic_words_always_present() {
        let d = dict();
        assert_eq!(d.wordid("<s>"), Some(d.start_wid()));
        assert_eq!(d.wordid("</s>"), Some(d.finish_wid()));
        assert_eq!(d.wordid("<sil>"), Some(d.silence_wid()));
        assert!(!d.real_word(d.silence_wid()));
        assert_eq!(d.word(d.silence_wid()).phones(), &[0]);
    }

    #[test]
    fn word_ids_are_stable() {
        let mut d = dict();
        let ab = d.add_word_str("ab", &["AX", "B"], false).unwrap();
        assert_eq!(d.wordid("ab"), Some(ab));
        assert_eq!(d.wordid("AB"), Some(ab));
        for i in 0..500 {
            d.add_word_str(&format!("w{i}"), &["AX"], false).unwrap();
        }
        // Previously assigned ids never shift.
        assert_eq!(d.wordid("ab"), Some(ab));
        assert_eq!(d.word(ab).text(), "ab");
    }

    #[test]
    fn unknown_phone_is_invalid_phones() {
        let mut d = dict();
        match d.add_word_str("zap", &["AX", "ZZ"], false) {
            Err(Error::InvalidPhones { word, phone }) => {
                assert_eq!(word, "zap");
                assert_eq!(phone, "ZZ");
            }
            other => panic!("expected InvalidPhones, got {other:?}"),
        }
        assert_eq!(d.wordid("zap"), None);
    }

    #[test]
    fn reads_dictionary_files_and_alternates() {
        let mut d = dict();
        let text = "\
;; comment line
ABBA AX B AX
ABBA(2) AX B B AX
BA B AX
BAD B AX ZZ
";
        d.read_entries(Cursor::new(text), false).unwrap();
        let abba = d.wordid("abba").unwrap();
        assert_eq!(d.word(abba).phones(), &[1, 2, 1]);
        assert!(d.wordid("ba").is_some());
        // The entry with a bad phone is skipped, not fatal.
        assert_eq!(d.wordid("bad"), None);
        assert!(d.real_word(abba));
    }

    #[test]
    fn filler_entries_marked() {
        let mut d = dict();
        d.read_entries(Cursor::new("<noise> SIL\n"), true).unwrap();
        let w = d.wordid("<noise>").unwrap();
        assert!(!d.real_word(w));
    }
}
