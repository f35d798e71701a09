//! Deterministic PRNG keyed by the combined game secret
//!
//! Output is the concatenation of `HMAC-SHA256(key, be_u64(i))` blocks for
//! `i = 1, 2, ...`. Every participant seeded with the same secret reads the
//! same stream and so derives the same outcome.

use crate::errors::FlipResult;
use crate::secret::{keyed_mac, HmacSha256, Secret};
use hmac::Mac;
use num_bigint::{BigInt, BigUint, Sign};

pub struct Prng {
    mac: HmacSha256,
    buf: Vec<u8>,
    pos: usize,
    counter: u64,
}

impl Prng {
    pub fn new(key: Secret) -> FlipResult<Self> {
        Ok(Self {
            mac: keyed_mac(key.as_bytes())?,
            buf: Vec::new(),
            pos: 0,
            counter: 1,
        })
    }

    fn replenish(&mut self) {
        let mut mac = self.mac.clone();
        mac.update(&self.counter.to_be_bytes());
        self.counter += 1;
        self.buf.clear();
        self.buf.extend_from_slice(&mac.finalize().into_bytes());
        self.pos = 0;
    }

    fn read(&mut self, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos == self.buf.len() {
                self.replenish();
            }
            let n = (out.len() - filled).min(self.buf.len() - self.pos);
            out[filled..filled + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
    }

    pub fn bool(&mut self) -> bool {
        let mut b = [0u8; 1];
        self.read(&mut b);
        b[0] & 1 == 1
    }

    /// Uniform value in `[0, m)`, or `(m, 0]` when `m` is negative.
    ///
    /// Rejection sampling over the smallest whole number of bytes covering
    /// `|m|`, with the top byte masked down to the bit length of `|m|`.
    pub fn big(&mut self, modulus: &BigInt) -> BigInt {
        let bound: &BigUint = modulus.magnitude();
        if bound.bits() == 0 {
            return BigInt::default();
        }

        let bits = bound.bits();
        let nbytes = ((bits + 7) / 8) as usize;
        let mask = 0xffu8 >> (8 * nbytes as u64 - bits);
        let mut buf = vec![0u8; nbytes];

        let value = loop {
            self.read(&mut buf);
            buf[0] &= mask;
            let candidate = BigUint::from_bytes_be(&buf);
            if &candidate < bound {
                break candidate;
            }
        };

        let value = BigInt::from_biguint(Sign::Plus, value);
        if modulus.sign() == Sign::Minus {
            -value
        } else {
            value
        }
    }

    pub fn int(&mut self, modulus: i64) -> i64 {
        // |result| < |modulus| <= 2^63, so the narrowing cannot fail
        i64::try_from(&self.big(&BigInt::from(modulus))).unwrap_or_default()
    }

    /// Shuffle of `0..n`, swapping position `i` with a draw from `[0, i)`
    pub fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut ret: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = self.int(i as i64) as usize;
            ret.swap(i, j);
        }
        ret
    }
}
