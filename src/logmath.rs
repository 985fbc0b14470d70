//! Integer log arithmetic. All acoustic and language scores in the engine live in a fixed-point
//! log domain: `log(x) = ln(x) / ln(base) >> shift` for a base just above 1.0 (1.0001 by
//! default). Probabilities become comfortably-sized negative integers, multiplication becomes
//! addition, and the only awkward operation, adding two probabilities, is served by a precomputed
//! table of `log(1 + base^-d)` deltas.
//!
//! Two instances exist at runtime: the main one (shift 0) shared by the whole decoder, and an
//! 8-bit-friendly one (shift 10) used by the mixture weight scorer so its table entries fit in a
//! byte-scaled range.
use crate::error::{Error, Result};

/// Sentinel for "no path" / log(0). Far enough from `i32::MIN` that a handful of additions can't
/// wrap.
pub const WORST_SCORE: i32 = -(1 << 29);

#[derive(Debug, Clone)]
pub struct LogMath {
    base: f64,
    log_of_base: f64,
    inv_log_of_base: f64,
    shift: u32,
    table: Vec<u16>,
}

impl LogMath {
    /// Build a log-add table for the given base and shift. Bases at or below 1.0 make the whole
    /// scheme degenerate so they are rejected.
    pub fn new(base: f64, shift: u32) -> Result<Self> {
        if base <= 1.0 {
            return Err(Error::InvalidConfig(format!(
                "logbase must be > 1.0, got {base}"
            )));
        }
        let log_of_base = base.ln();
        let inv_log_of_base = 1.0 / log_of_base;

        // table[d] = log_b(1 + b^-(d << shift)) >> shift, rounded. The entries decay to zero;
        // the table ends at the first zero since adding nothing is the identity.
        let mut table = Vec::new();
        let mut d: u64 = 0;
        loop {
            let diff = (d << shift) as f64;
            let val = (1.0 + base.powf(-diff)).ln() * inv_log_of_base;
            let entry = ((val / (1u64 << shift) as f64) + 0.5) as u64;
            if entry == 0 && d > 0 {
                break;
            }
            debug_assert!(entry <= u16::MAX as u64);
            table.push(entry as u16);
            d += 1;
        }
        Ok(Self {
            base,
            log_of_base,
            inv_log_of_base,
            shift,
            table,
        })
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Convert a natural-log value into this log domain.
    pub fn ln_to_log(&self, ln: f64) -> i32 {
        if !ln.is_finite() {
            return WORST_SCORE;
        }
        let v = ln * self.inv_log_of_base;
        let v = v / (1u64 << self.shift) as f64;
        if v <= WORST_SCORE as f64 {
            WORST_SCORE
        } else {
            v.round() as i32
        }
    }

    /// Convert a linear probability into the log domain. Zero and negative inputs pin to
    /// [`WORST_SCORE`].
    pub fn log(&self, p: f64) -> i32 {
        if p <= 0.0 {
            WORST_SCORE
        } else {
            self.ln_to_log(p.ln())
        }
    }

    /// Back to linear. Mostly useful for reporting posteriors.
    pub fn exp(&self, score: i32) -> f64 {
        (score as f64 * (1u64 << self.shift) as f64 * self.log_of_base).exp()
    }

    pub fn log_to_ln(&self, score: i32) -> f64 {
        score as f64 * (1u64 << self.shift) as f64 * self.log_of_base
    }

    /// log(p + q) given log(p) and log(q): `max + table[|x - y|]`.
    pub fn add(&self, x: i32, y: i32) -> i32 {
        let (hi, lo) = if x > y { (x, y) } else { (y, x) };
        if lo <= WORST_SCORE {
            return hi;
        }
        let d = (hi - lo) as usize;
        if d >= self.table.len() {
            hi
        } else {
            hi + self.table[d] as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_and_exp_round_trip() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        for &p in &[1.0, 0.5, 0.1, 1e-10, 1e-40] {
            let l = lmath.log(p);
            let back = lmath.exp(l);
            assert!(
                (back - p).abs() / p < 1e-3,
                "round trip {p} -> {l} -> {back}"
            );
        }
        assert_eq!(lmath.log(0.0), WORST_SCORE);
        assert_eq!(lmath.log(-1.0), WORST_SCORE);
    }

    #[test]
    fn add_matches_linear_domain() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let cases = [(0.5, 0.25), (0.9, 0.05), (1e-20, 1e-22), (0.3, 0.3)];
        for (p, q) in cases {
            let got = lmath.exp(lmath.add(lmath.log(p), lmath.log(q)));
            let want = p + q;
            assert!(
                (got - want).abs() / want < 1e-2,
                "logadd({p},{q}) = {got}, want {want}"
            );
        }
    }

    #[test]
    fn add_with_worst_is_identity() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let x = lmath.log(0.125);
        assert_eq!(lmath.add(x, WORST_SCORE), x);
        assert_eq!(lmath.add(WORST_SCORE, x), x);
    }

    #[test]
    fn shifted_table_fits_small_entries() {
        // The shift-10 instance backs the 8-bit mixture weight scorer; its largest table entry
        // (log 2 in shifted units) has to stay tiny.
        let lmath = LogMath::new(1.0001, 10).unwrap();
        assert!(lmath.table[0] < 16);
        let x = lmath.log(0.5);
        let y = lmath.log(0.5);
        let sum = lmath.exp(lmath.add(x, y));
        assert!((sum - 1.0).abs() < 0.05, "0.5 + 0.5 = {sum}");
    }

    #[test]
    fn bad_base_rejected() {
        assert!(LogMath::new(1.0, 0).is_err());
        assert!(LogMath::new(0.9, 0).is_err());
    }
}
