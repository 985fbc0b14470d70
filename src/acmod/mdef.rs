//! Model definition: the phone inventory and the state tying that maps every (tri)phone onto a
//! senone sequence and a transition matrix.
//!
//! The on-disk format is the text one: a version line (`0.3`), counts for base phones,
//! triphones, state mappings, tied states, tied CI states and tied matrices, then one line per
//! phone of `base left right position attribute tmat senone-ids... N`. Context-independent
//! phones come first with `-` contexts; triphones follow with a word-position flag of
//! b/e/s/i. We dedupe the senone sequences so search nodes can share an ssid.
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use tracing::info;

pub type CiPhoneId = u16;
pub type PhoneId = u32;
pub type SenoneId = u16;
pub type SsId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WordPosition {
    Begin,
    End,
    Single,
    Internal,
    Undefined,
}

impl WordPosition {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "b" => Some(Self::Begin),
            "e" => Some(Self::End),
            "s" => Some(Self::Single),
            "i" => Some(Self::Internal),
            "-" => Some(Self::Undefined),
            _ => None,
        }
    }
}

impl fmt::Display for WordPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c = match self {
            Self::Begin => 'b',
            Self::End => 'e',
            Self::Single => 's',
            Self::Internal => 'i',
            Self::Undefined => '-',
        };
        write!(f, "{c}")
    }
}

#[derive(Debug, Clone)]
pub struct Phone {
    pub base: CiPhoneId,
    pub tmat: u32,
    pub ssid: SsId,
    pub filler: bool,
}

#[derive(Debug)]
pub struct Mdef {
    ciphone_names: Vec<String>,
    ciphone_map: BTreeMap<String, CiPhoneId>,
    phones: Vec<Phone>,
    /// Deduplicated senone sequences, one per distinct emitting-state tying.
    sseqs: Vec<Vec<SenoneId>>,
    tri_map: BTreeMap<(CiPhoneId, CiPhoneId, CiPhoneId, WordPosition), PhoneId>,
    /// Base CI phone of each senone; well defined because states are only shared within a base
    /// phone's triphones.
    sen2ci: Vec<CiPhoneId>,
    n_emit_state: usize,
    n_sen: usize,
    n_ci_sen: usize,
    n_tmat: usize,
}

impl Mdef {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        Self::from_reader(io::BufReader::new(file), path)
    }

    /// Parse from any reader; tests hand in string fixtures.
    pub fn from_reader(reader: impl BufRead, path: &Path) -> Result<Self> {
        let err = |line: usize, msg: String| Error::model(path, format!("line {line}: {msg}"));
        let mut lines = reader
            .lines()
            .enumerate()
            .filter_map(|(no, l)| match l {
                Ok(l) => {
                    let t = l.trim().to_string();
                    if t.is_empty() || t.starts_with('#') {
                        None
                    } else {
                        Some(Ok((no + 1, t)))
                    }
                }
                Err(e) => Some(Err(Error::Io(e))),
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter();

        let (no, version) = lines
            .next()
            .ok_or_else(|| Error::model(path, "empty mdef"))?;
        if version != "0.3" {
            return Err(err(no, format!("unsupported mdef version {version:?}")));
        }

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for _ in 0..6 {
            let (no, line) = lines
                .next()
                .ok_or_else(|| Error::model(path, "truncated mdef counts"))?;
            let mut parts = line.split_whitespace();
            let (Some(num), Some(name)) = (parts.next(), parts.next()) else {
                return Err(err(no, format!("bad count line {line:?}")));
            };
            let num: usize = num
                .parse()
                .map_err(|_| err(no, format!("bad count {num:?}")))?;
            counts.insert(name.to_string(), num);
        }
        let want = |name: &str| -> Result<usize> {
            counts
                .get(name)
                .copied()
                .ok_or_else(|| Error::model(path, format!("missing {name} count")))
        };
        let n_base = want("n_base")?;
        let n_tri = want("n_tri")?;
        let n_sen = want("n_tied_state")?;
        let n_ci_sen = want("n_tied_ci_state")?;
        let n_tmat = want("n_tied_tmat")?;

        let mut mdef = Mdef {
            ciphone_names: Vec::with_capacity(n_base),
            ciphone_map: BTreeMap::new(),
            phones: Vec::with_capacity(n_base + n_tri),
            sseqs: Vec::new(),
            tri_map: BTreeMap::new(),
            sen2ci: vec![CiPhoneId::MAX; n_sen],
            n_emit_state: 0,
            n_sen,
            n_ci_sen,
            n_tmat,
        };
        let mut sseq_map: BTreeMap<Vec<SenoneId>, SsId> = BTreeMap::new();

        for (no, line) in lines {
            let toks: Vec<&str> = line.split_whitespace().collect();
            if toks.len() < 7 {
                return Err(err(no, format!("short phone line {line:?}")));
            }
            let (base_s, left_s, right_s, pos_s, attrib) =
                (toks[0], toks[1], toks[2], toks[3], toks[4]);
            let tmat: u32 = toks[5]
                .parse()
                .map_err(|_| err(no, format!("bad tmat id {:?}", toks[5])))?;
            if tmat as usize >= n_tmat {
                return Err(err(no, format!("tmat id {tmat} out of range")));
            }
            let state_toks = &toks[6..];
            let Some((last, emit)) = state_toks.split_last() else {
                return Err(err(no, "missing state map".into()));
            };
            if *last != "N" {
                return Err(err(no, format!("state map must end with N, got {last:?}")));
            }
            let mut senones = Vec::with_capacity(emit.len());
            for s in emit {
                let sen: SenoneId = s
                    .parse()
                    .map_err(|_| err(no, format!("bad senone id {s:?}")))?;
                if (sen as usize) >= n_sen {
                    return Err(err(no, format!("senone id {sen} out of range")));
                }
                senones.push(sen);
            }
            if mdef.n_emit_state == 0 {
                mdef.n_emit_state = senones.len();
            } else if senones.len() != mdef.n_emit_state {
                return Err(err(
                    no,
                    format!(
                        "inconsistent state count {} (expected {})",
                        senones.len(),
                        mdef.n_emit_state
                    ),
                ));
            }
            let ssid = match sseq_map.get(&senones) {
                Some(&id) => id,
                None => {
                    let id = mdef.sseqs.len() as SsId;
                    sseq_map.insert(senones.clone(), id);
                    mdef.sseqs.push(senones.clone());
                    id
                }
            };

            let is_ci = left_s == "-" && right_s == "-";
            if is_ci {
                let ci = mdef.ciphone_names.len() as CiPhoneId;
                if mdef.ciphone_map.contains_key(base_s) {
                    return Err(err(no, format!("duplicate CI phone {base_s:?}")));
                }
                mdef.ciphone_names.push(base_s.to_string());
                mdef.ciphone_map.insert(base_s.to_string(), ci);
                mdef.phones.push(Phone {
                    base: ci,
                    tmat,
                    ssid,
                    filler: attrib == "filler",
                });
                for &sen in &senones {
                    mdef.sen2ci[sen as usize] = ci;
                }
            } else {
                if mdef.ciphone_names.len() != n_base {
                    return Err(err(no, "triphone before all CI phones".into()));
                }
                let look = |name: &str| -> Result<CiPhoneId> {
                    mdef.ciphone_map
                        .get(name)
                        .copied()
                        .ok_or_else(|| Error::model(path, format!("line {no}: unknown phone {name:?}")))
                };
                let base = look(base_s)?;
                let left = look(left_s)?;
                let right = look(right_s)?;
                let pos = WordPosition::parse(pos_s)
                    .ok_or_else(|| err(no, format!("bad word position {pos_s:?}")))?;
                let pid = mdef.phones.len() as PhoneId;
                mdef.phones.push(Phone {
                    base,
                    tmat,
                    ssid,
                    filler: attrib == "filler",
                });
                mdef.tri_map.insert((base, left, right, pos), pid);
                for &sen in &senones {
                    if mdef.sen2ci[sen as usize] == CiPhoneId::MAX {
                        mdef.sen2ci[sen as usize] = base;
                    }
                }
            }
        }

        if mdef.ciphone_names.len() != n_base {
            return Err(Error::model(
                path,
                format!(
                    "expected {n_base} CI phones, found {}",
                    mdef.ciphone_names.len()
                ),
            ));
        }
        if mdef.phones.len() != n_base + n_tri {
            return Err(Error::model(
                path,
                format!(
                    "expected {} phones, found {}",
                    n_base + n_tri,
                    mdef.phones.len()
                ),
            ));
        }
        info!(
            n_base,
            n_tri,
            n_sen,
            n_sseq = mdef.sseqs.len(),
            "model definition loaded"
        );
        Ok(mdef)
    }

    pub fn n_ciphone(&self) -> usize {
        self.ciphone_names.len()
    }

    pub fn n_phone(&self) -> usize {
        self.phones.len()
    }

    pub fn n_sen(&self) -> usize {
        self.n_sen
    }

    pub fn n_ci_sen(&self) -> usize {
        self.n_ci_sen
    }

    pub fn n_tmat(&self) -> usize {
        self.n_tmat
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    pub fn ciphone_id(&self, name: &str) -> Option<CiPhoneId> {
        self.ciphone_map.get(name).copied()
    }

    pub fn ciphone_name(&self, ci: CiPhoneId) -> &str {
        &self.ciphone_names[ci as usize]
    }

    pub fn phone(&self, pid: PhoneId) -> &Phone {
        &self.phones[pid as usize]
    }

    pub fn is_filler(&self, ci: CiPhoneId) -> bool {
        self.phones[ci as usize].filler
    }

    pub fn sseq(&self, ssid: SsId) -> &[SenoneId] {
        &self.sseqs[ssid as usize]
    }

    pub fn sen2ci(&self, sen: SenoneId) -> CiPhoneId {
        self.sen2ci[sen as usize]
    }

    /// Triphone lookup with graceful degradation: the exact position, then any position, then
    /// the context-independent phone. Sparse models rely on the fallbacks constantly.
    pub fn phone_id(
        &self,
        base: CiPhoneId,
        left: CiPhoneId,
        right: CiPhoneId,
        pos: WordPosition,
    ) -> PhoneId {
        if let Some(&pid) = self.tri_map.get(&(base, left, right, pos)) {
            return pid;
        }
        for alt in [
            WordPosition::Begin,
            WordPosition::End,
            WordPosition::Single,
            WordPosition::Internal,
        ] {
            if alt == pos {
                continue;
            }
            if let Some(&pid) = self.tri_map.get(&(base, left, right, alt)) {
                return pid;
            }
        }
        base as PhoneId
    }
}
