//! Cross-word triphone context tables.
//!
//! Word-internal phones get their senone sequence straight from the model definition, but the
//! edges of a word depend on neighboring words the search hasn't committed to yet. Three tables
//! cover that:
//!
//! - word-initial phones: a diphone table `(base, right) x left -> ssid`, consulted when a word
//!   is entered and the left neighbor is known;
//! - word-final phones: for each `(base, left)` a row of ssids over every possible right
//!   context, compressed into classes since many right contexts share a tying;
//! - single-phone words: the same compressed-row treatment keyed on the left context.
//!
//! The compressed rows are what let the search allocate one leaf HMM per distinct class rather
//! than one per phone.
use crate::acmod::mdef::{CiPhoneId, Mdef, SsId, WordPosition};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// A compressed right-context row: `cimap[rc]` names the class, `ssid[class]` the tying.
#[derive(Debug, Clone)]
pub struct XwdSsid {
    pub cimap: Vec<u16>,
    pub ssid: Vec<SsId>,
}

impl XwdSsid {
    fn compress(row: &[SsId]) -> Self {
        let mut classes: Vec<SsId> = Vec::new();
        let mut cimap = Vec::with_capacity(row.len());
        for &ssid in row {
            let class = match classes.iter().position(|&s| s == ssid) {
                Some(c) => c,
                None => {
                    classes.push(ssid);
                    classes.len() - 1
                }
            };
            cimap.push(class as u16);
        }
        Self {
            cimap,
            ssid: classes,
        }
    }

    pub fn n_class(&self) -> usize {
        self.ssid.len()
    }

    pub fn class_of(&self, rc: CiPhoneId) -> u16 {
        self.cimap[rc as usize]
    }
}

#[derive(Debug)]
pub struct Dict2Pid {
    mdef: Arc<Mdef>,
    /// (base * n_ci + right) * n_ci + left -> ssid, for word-initial positions.
    ldiph_lc: Vec<SsId>,
    /// (base, left) -> compressed right-context row, word-final positions.
    rssid: BTreeMap<(CiPhoneId, CiPhoneId), XwdSsid>,
    /// (base, left) -> compressed right-context row for single-phone words.
    lrssid: BTreeMap<(CiPhoneId, CiPhoneId), XwdSsid>,
    n_ci: usize,
}

impl Dict2Pid {
    pub fn build(mdef: Arc<Mdef>) -> Self {
        let n_ci = mdef.n_ciphone();
        let mut ldiph_lc = vec![0; n_ci * n_ci * n_ci];
        for b in 0..n_ci as CiPhoneId {
            for r in 0..n_ci as CiPhoneId {
                for l in 0..n_ci as CiPhoneId {
                    let pid = mdef.phone_id(b, l, r, WordPosition::Begin);
                    ldiph_lc[(b as usize * n_ci + r as usize) * n_ci + l as usize] =
                        mdef.phone(pid).ssid;
                }
            }
        }

        let mut rssid = BTreeMap::new();
        let mut lrssid = BTreeMap::new();
        let mut row = vec![0; n_ci];
        for b in 0..n_ci as CiPhoneId {
            for l in 0..n_ci as CiPhoneId {
                for r in 0..n_ci as CiPhoneId {
                    let pid = mdef.phone_id(b, l, r, WordPosition::End);
                    row[r as usize] = mdef.phone(pid).ssid;
                }
                rssid.insert((b, l), XwdSsid::compress(&row));
                for r in 0..n_ci as CiPhoneId {
                    let pid = mdef.phone_id(b, l, r, WordPosition::Single);
                    row[r as usize] = mdef.phone(pid).ssid;
                }
                lrssid.insert((b, l), XwdSsid::compress(&row));
            }
        }
        info!(n_ci, "cross-word context tables built");
        Self {
            mdef,
            ldiph_lc,
            rssid,
            lrssid,
            n_ci,
        }
    }

    /// Senone sequence for a word-initial phone `b` with right neighbor `r` (the word's second
    /// phone) and left context `l` (the previous word's last phone).
    pub fn ldiph(&self, b: CiPhoneId, r: CiPhoneId, l: CiPhoneId) -> SsId {
        self.ldiph_lc[(b as usize * self.n_ci + r as usize) * self.n_ci + l as usize]
    }

    /// Compressed right-context row for a word-final phone.
    pub fn rssid(&self, b: CiPhoneId, l: CiPhoneId) -> &XwdSsid {
        &self.rssid[&(b, l)]
    }

    /// Compressed right-context row for a single-phone word with known left context.
    pub fn lrssid(&self, b: CiPhoneId, l: CiPhoneId) -> &XwdSsid {
        &self.lrssid[&(b, l)]
    }

    /// Word-internal phone: full triphone lookup with CI fallback.
    pub fn internal(&self, b: CiPhoneId, l: CiPhoneId, r: CiPhoneId) -> SsId {
        let pid = self.mdef.phone_id(b, l, r, WordPosition::Internal);
        self.mdef.phone(pid).ssid
    }

    /// Tmat for a base phone; transition matrices are tied to the CI phone.
    pub fn tmat(&self, b: CiPhoneId) -> u32 {
        self.mdef.phone(b as u32).tmat
    }

    pub fn mdef(&self) -> &Arc<Mdef> {
        &self.mdef
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acmod::mdef::tests::toy_mdef;

    #[test]
    fn classes_cover_every_right_context() {
        let mdef = Arc::new(toy_mdef());
        let d2p = Dict2Pid::build(mdef.clone());
        for b in 0..mdef.n_ciphone() as CiPhoneId {
            for l in 0..mdef.n_ciphone() as CiPhoneId {
                let row = d2p.rssid(b, l);
                assert_eq!(row.cimap.len(), mdef.n_ciphone());
                for rc in 0..mdef.n_ciphone() as CiPhoneId {
                    let class = row.class_of(rc);
                    assert!((class as usize) < row.n_class());
                    // The class ssid must be the one the uncompressed lookup gives.
                    let pid = mdef.phone_id(b, l, rc, WordPosition::End);
                    assert_eq!(row.ssid[class as usize], mdef.phone(pid).ssid);
                }
            }
        }
    }

    #[test]
    fn begin_diphone_uses_triphone_when_it_exists() {
        let mdef = Arc::new(toy_mdef());
        let d2p = Dict2Pid::build(mdef.clone());
        let ax = mdef.ciphone_id("AX").unwrap();
        let b = mdef.ciphone_id("B").unwrap();
        let sil = mdef.ciphone_id("SIL").unwrap();
        // "AX SIL B b" exists in the toy model.
        assert_eq!(mdef.sseq(d2p.ldiph(ax, b, sil)), &[12, 13, 14]);
        // Unmodeled contexts collapse to the CI sequence.
        assert_eq!(mdef.sseq(d2p.ldiph(sil, ax, b)), &[0, 1, 2]);
    }

    #[test]
    fn end_contexts_compress() {
        let mdef = Arc::new(toy_mdef());
        let d2p = Dict2Pid::build(mdef.clone());
        let ax = mdef.ciphone_id("AX").unwrap();
        let b = mdef.ciphone_id("B").unwrap();
        // With left AX: right SIL hits "B AX SIL e", right AX falls back to the internal
        // "B AX AX i" tying, and right B falls through to CI. Three distinct classes.
        let row = d2p.rssid(b, ax);
        assert_eq!(row.n_class(), 3);
        assert_ne!(row.class_of(0), row.class_of(ax));
        // With an unmodeled left context every right context collapses to the CI class.
        let row = d2p.rssid(b, b);
        assert_eq!(row.n_class(), 1);
    }
}
