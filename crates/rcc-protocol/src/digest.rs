//! Content digests.
//!
//! A [`Digest256`] is a sha256 split into four big-endian `u64` words.
//! The split form makes the XOR-combining schemes cheap (object-cache keys
//! and PCH fingerprints fold dependency digests and sizes into a base hash)
//! and keeps the wire representation free of hex strings.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// A 256-bit content digest as four big-endian `u64` words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest256(pub [u64; 4]);

impl Digest256 {
    /// The all-zero digest, used as "not computed".
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    /// Fold another digest into this one, word by word.
    pub fn xor_with(&mut self, other: &Digest256) {
        for (w, o) in self.0.iter_mut().zip(other.0.iter()) {
            *w ^= o;
        }
    }

    /// XOR a plain value into the first word (dependency sizes are mixed
    /// in this way so that equal contents with different sizes — possible
    /// only through hash tricks — still produce distinct keys).
    pub fn xor_first_word(&mut self, v: u64) {
        self.0[0] ^= v;
    }

    /// Build from a finished sha256 state.
    pub fn from_sha256(hasher: Sha256) -> Digest256 {
        let bytes = hasher.finalize();
        let mut words = [0u64; 4];
        for (i, w) in words.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *w = u64::from_be_bytes(buf);
        }
        Digest256(words)
    }

    /// Hash a byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Digest256 {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest256::from_sha256(hasher)
    }

    /// Hash a byte slice, honoring the generated-file shortcut.
    ///
    /// Machine-generated sources may begin with
    /// `//crc64:<hex>\n//crc64_with_comments:<hex>\n`; those two words
    /// identify the content and make whole-buffer hashing unnecessary.
    pub fn of_bytes_with_crc64_header(bytes: &[u8]) -> Digest256 {
        if bytes.len() > 70 && bytes.starts_with(b"//crc64:") {
            if let Some(d) = parse_crc64_header(bytes) {
                return d;
            }
        }
        Digest256::of_bytes(bytes)
    }

    /// Hash a whole file with a streaming read.
    pub fn of_file(path: &Path) -> io::Result<Digest256> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest256::from_sha256(hasher))
    }

    /// Long hex form: `{w0:x}-{w1:x}-{w2:x}-{w3:x}`.
    pub fn to_long_hex(&self) -> String {
        format!("{:x}-{:x}-{:x}-{:x}", self.0[0], self.0[1], self.0[2], self.0[3])
    }

    /// Short hex form: the XOR of all four words, for log lines and
    /// directory names.
    pub fn to_short_hex(&self) -> String {
        format!("{:x}", self.0[0] ^ self.0[1] ^ self.0[2] ^ self.0[3])
    }

    /// Parse the long hex form. Returns `None` (never a partial digest)
    /// on any malformed input.
    pub fn from_long_hex(s: &str) -> Option<Digest256> {
        let mut words = [0u64; 4];
        let mut parts = s.trim().split('-');
        for w in words.iter_mut() {
            *w = u64::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Digest256(words))
    }
}

impl fmt::Display for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_long_hex())
    }
}

fn parse_crc64_header(bytes: &[u8]) -> Option<Digest256> {
    let text = std::str::from_utf8(&bytes[..bytes.len().min(160)]).ok()?;
    let rest = text.strip_prefix("//crc64:")?;
    let (crc_hex, rest) = rest.split_once('\n')?;
    let rest = rest.strip_prefix("//crc64_with_comments:")?;
    let crc_comments_hex = rest.split('\n').next()?;
    let w0 = u64::from_str_radix(crc_hex.trim(), 16).ok()?;
    let w1 = u64::from_str_radix(crc_comments_hex.trim(), 16).ok()?;
    Some(Digest256([w0, w1, 0, 0]))
}

/// FNV-1a 32-bit hash. The client pins every translation unit to a worker
/// by `fnv1a_32(basename) % worker_count`, so repeated builds (even from a
/// moved checkout) land on the same worker's caches.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn words_match_reference_sha256() {
        // sha256("abc") = ba7816bf 8f01cfea 414140de 5dae2223
        //                 b00361a3 96177a9c b410ff61 f20015ad
        let d = Digest256::of_bytes(b"abc");
        assert_eq!(d.0[0], 0xba7816bf8f01cfea);
        assert_eq!(d.0[1], 0x414140de5dae2223);
        assert_eq!(d.0[2], 0xb00361a396177a9c);
        assert_eq!(d.0[3], 0xb410ff61f20015ad);
    }

    #[test]
    fn long_hex_round_trip() {
        let d = Digest256::of_bytes(b"round trip");
        let parsed = Digest256::from_long_hex(&d.to_long_hex()).unwrap();
        assert_eq!(d, parsed);
        assert!(Digest256::from_long_hex("zz-1-2-3").is_none());
        assert!(Digest256::from_long_hex("1-2-3").is_none());
        assert!(Digest256::from_long_hex("1-2-3-4-5").is_none());
    }

    #[test]
    fn xor_is_self_inverse() {
        let mut d = Digest256::of_bytes(b"a");
        let other = Digest256::of_bytes(b"b");
        let orig = d;
        d.xor_with(&other);
        assert_ne!(d, orig);
        d.xor_with(&other);
        assert_eq!(d, orig);
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let content = vec![7u8; 200_000]; // spans several read buffers
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&content)
            .unwrap();
        assert_eq!(Digest256::of_file(&path).unwrap(), Digest256::of_bytes(&content));
    }

    #[test]
    fn crc64_header_shortcut() {
        let mut content = b"//crc64:1a2b3c\n//crc64_with_comments:4d5e6f\n".to_vec();
        content.extend(std::iter::repeat(b'x').take(100));
        let d = Digest256::of_bytes_with_crc64_header(&content);
        assert_eq!(d, Digest256([0x1a2b3c, 0x4d5e6f, 0, 0]));

        // a near miss falls back to content hashing
        let mut other = b"//crc64 not really a header line padding padding\n".to_vec();
        other.extend(std::iter::repeat(b'y').take(100));
        assert_eq!(
            Digest256::of_bytes_with_crc64_header(&other),
            Digest256::of_bytes(&other)
        );
    }

    #[test]
    fn fnv_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }
}
