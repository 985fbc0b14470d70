//! Reader for the S3 binary model format shared by the acoustic model files (Gaussian means and
//! variances, mixture weights, transition matrices, LDA transforms).
//!
//! The layout is an ASCII header (`s3\n`, then `key value\n` lines, optionally a bare `chksum0`
//! marker, then `endhdr\n`), a four byte byte-order sentinel `0x11223344` written in the
//! producer's endianness, and then binary arrays. Each array is its dimension counts as `u32`s
//! followed by raw elements; when `chksum0` was declared, a rolling 32-bit checksum over every
//! element read trails the data. We detect foreign endianness from the sentinel and swap every
//! multi-byte quantity on the way in.
//!
//! The reader works from an owned byte buffer so tests can feed it in-memory blobs instead of
//! littering the tree with fixture files.
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct S3File {
    path: PathBuf,
    data: Vec<u8>,
    pos: usize,
    headers: Vec<(String, String)>,
    swap: bool,
    do_chksum: bool,
    chksum: u32,
}

const BYTE_ORDER_MAGIC: u32 = 0x11223344;

impl S3File {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        Ok(Self::from_bytes(data, path.as_ref().to_path_buf()))
    }

    /// `path` is only used for error messages; in-memory callers can pass anything descriptive.
    pub fn from_bytes(data: Vec<u8>, path: PathBuf) -> Self {
        Self {
            path,
            data,
            pos: 0,
            headers: Vec::new(),
            swap: false,
            do_chksum: false,
            chksum: 0,
        }
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        Error::model(self.path.clone(), reason)
    }

    fn read_line(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != b'\n' {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(self.err("unexpected EOF in header"));
        }
        let line = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| self.err("non-UTF8 header line"))?
            .to_string();
        self.pos += 1;
        Ok(line)
    }

    /// Parse the ASCII header and the byte-order sentinel. When `version` is given the header's
    /// `version` entry must match.
    pub fn parse_header(&mut self, version: Option<&str>) -> Result<()> {
        let magic = self.read_line()?;
        if magic.trim() != "s3" {
            return Err(self.err(format!("bad magic line {magic:?}, expected \"s3\"")));
        }
        loop {
            let line = self.read_line()?;
            let line = line.trim();
            if line == "endhdr" {
                break;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default().to_string();
            let value = parts.next().unwrap_or_default().trim().to_string();
            if key == "chksum0" {
                self.do_chksum = true;
            }
            self.headers.push((key, value));
        }
        let sentinel_bytes: [u8; 4] = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| self.err("EOF at byte-order sentinel"))?
            .try_into()
            .unwrap();
        self.pos += 4;
        let native = u32::from_ne_bytes(sentinel_bytes);
        if native == BYTE_ORDER_MAGIC {
            self.swap = false;
        } else if native.swap_bytes() == BYTE_ORDER_MAGIC {
            self.swap = true;
        } else {
            return Err(self.err(format!("bad byte-order sentinel {native:#010x}")));
        }
        if let Some(want) = version {
            match self.header("version") {
                Some(got) if got == want => {}
                Some(got) => {
                    return Err(self.err(format!("version {got:?}, expected {want:?}")));
                }
                None => return Err(self.err("missing version header")),
            }
        }
        self.chksum = 0;
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn accum(&mut self, val: u32) {
        // Rotate-left-by-5 and add, per element, matching the producer.
        self.chksum = (self.chksum.rotate_left(5)).wrapping_add(val);
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| self.err("unexpected EOF reading u32"))?
            .try_into()
            .unwrap();
        self.pos += 4;
        let v = if self.swap {
            u32::from_ne_bytes(bytes).swap_bytes()
        } else {
            u32::from_ne_bytes(bytes)
        };
        if self.do_chksum {
            self.accum(v);
        }
        Ok(v)
    }

    pub fn get_f32_into(&mut self, out: &mut Vec<f32>, n: usize) -> Result<()> {
        let nbytes = n
            .checked_mul(4)
            .ok_or_else(|| self.err("array size overflow"))?;
        if self.pos + nbytes > self.data.len() {
            return Err(self.err(format!(
                "unexpected EOF: wanted {n} f32 elements, {} bytes left",
                self.data.len() - self.pos
            )));
        }
        out.reserve(n);
        let mut chksum = self.chksum;
        for chunk in self.data[self.pos..self.pos + nbytes].chunks_exact(4) {
            let bits = u32::from_ne_bytes(chunk.try_into().unwrap());
            let bits = if self.swap { bits.swap_bytes() } else { bits };
            if self.do_chksum {
                chksum = chksum.rotate_left(5).wrapping_add(bits);
            }
            out.push(f32::from_bits(bits));
        }
        self.chksum = chksum;
        self.pos += nbytes;
        Ok(())
    }

    pub fn get_f32_vec(&mut self, n: usize) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        self.get_f32_into(&mut out, n)?;
        Ok(out)
    }

    pub fn get_u8_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.pos + n > self.data.len() {
            return Err(self.err("unexpected EOF reading byte array"));
        }
        let out = self.data[self.pos..self.pos + n].to_vec();
        if self.do_chksum {
            for &b in &out {
                self.accum(b as u32);
            }
        }
        self.pos += n;
        Ok(out)
    }

    /// Counted 1-D array: `u32` length then elements.
    pub fn get_1d_f32(&mut self) -> Result<Vec<f32>> {
        let n = self.get_u32()? as usize;
        self.get_f32_vec(n)
    }

    /// Counted 2-D array: two `u32` dims then row-major elements.
    pub fn get_2d_f32(&mut self) -> Result<(Vec<f32>, [usize; 2])> {
        let d0 = self.get_u32()? as usize;
        let d1 = self.get_u32()? as usize;
        let data = self.get_f32_vec(d0.checked_mul(d1).ok_or_else(|| self.err("dim overflow"))?)?;
        Ok((data, [d0, d1]))
    }

    /// Counted 3-D array: three `u32` dims then row-major elements.
    pub fn get_3d_f32(&mut self) -> Result<(Vec<f32>, [usize; 3])> {
        let d0 = self.get_u32()? as usize;
        let d1 = self.get_u32()? as usize;
        let d2 = self.get_u32()? as usize;
        let n = d0
            .checked_mul(d1)
            .and_then(|x| x.checked_mul(d2))
            .ok_or_else(|| self.err("dim overflow"))?;
        let data = self.get_f32_vec(n)?;
        Ok((data, [d0, d1, d2]))
    }

    /// Verify the trailing checksum if the header declared one. Call after the final array.
    pub fn verify_chksum(&mut self) -> Result<()> {
        if !self.do_chksum {
            return Ok(());
        }
        let computed = self.chksum;
        // The stored checksum itself is excluded from accumulation.
        self.do_chksum = false;
        let stored = self.get_u32()?;
        self.do_chksum = true;
        if stored != computed {
            return Err(self.err(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(le: bool) -> Vec<u8> {
        let mut v = b"s3\nversion 1.0\nkey2  value2\n# a comment\nendhdr\n".to_vec();
        if le {
            v.extend_from_slice(&0x11223344u32.to_le_bytes());
            v.extend_from_slice(&2u32.to_le_bytes());
            v.extend_from_slice(&1.5f32.to_le_bytes());
            v.extend_from_slice(&(-2.0f32).to_le_bytes());
        } else {
            v.extend_from_slice(&0x11223344u32.to_be_bytes());
            v.extend_from_slice(&2u32.to_be_bytes());
            v.extend_from_slice(&1.5f32.to_be_bytes());
            v.extend_from_slice(&(-2.0f32).to_be_bytes());
        }
        v
    }

    #[test]
    fn either_endianness_reads_identically() {
        for le in [true, false] {
            let mut s = S3File::from_bytes(blob(le), PathBuf::from("<test>"));
            s.parse_header(Some("1.0")).unwrap();
            let arr = s.get_1d_f32().unwrap();
            assert_eq!(arr, vec![1.5, -2.0], "le={le}");
        }
    }

    #[test]
    fn header_entries_are_kept() {
        let mut s = S3File::from_bytes(blob(true), PathBuf::from("<test>"));
        s.parse_header(None).unwrap();
        assert_eq!(s.header("version"), Some("1.0"));
        assert_eq!(s.header("key2"), Some("value2"));
        assert_eq!(s.header("nope"), None);
    }

    #[test]
    fn version_mismatch_is_invalid_model() {
        let mut s = S3File::from_bytes(blob(true), PathBuf::from("<test>"));
        assert!(matches!(
            s.parse_header(Some("0.1")),
            Err(Error::InvalidModel { .. })
        ));
    }

    #[test]
    fn bad_sentinel_rejected() {
        let mut v = b"s3\nendhdr\n".to_vec();
        v.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        let mut s = S3File::from_bytes(v, PathBuf::from("<test>"));
        assert!(s.parse_header(None).is_err());
    }

    #[test]
    fn checksum_round_trip() {
        let mut v = b"s3\nchksum0\nendhdr\n".to_vec();
        v.extend_from_slice(&0x11223344u32.to_le_bytes());
        v.extend_from_slice(&2u32.to_le_bytes());
        v.extend_from_slice(&0.25f32.to_le_bytes());
        v.extend_from_slice(&4.0f32.to_le_bytes());
        // Compute the rolling checksum the same way the producer would.
        let mut ck: u32 = 0;
        for val in [2u32, 0.25f32.to_bits(), 4.0f32.to_bits()] {
            ck = ck.rotate_left(5).wrapping_add(val);
        }
        v.extend_from_slice(&ck.to_le_bytes());

        let mut s = S3File::from_bytes(v, PathBuf::from("<test>"));
        s.parse_header(None).unwrap();
        let arr = s.get_1d_f32().unwrap();
        assert_eq!(arr, vec![0.25, 4.0]);
        s.verify_chksum().unwrap();
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut v = b"s3\nchksum0\nendhdr\n".to_vec();
        v.extend_from_slice(&0x11223344u32.to_le_bytes());
        v.extend_from_slice(&1u32.to_le_bytes());
        v.extend_from_slice(&1.0f32.to_le_bytes());
        v.extend_from_slice(&0u32.to_le_bytes());
        let mut s = S3File::from_bytes(v, PathBuf::from("<test>"));
        s.parse_header(None).unwrap();
        s.get_1d_f32().unwrap();
        assert!(s.verify_chksum().is_err());
    }
}
