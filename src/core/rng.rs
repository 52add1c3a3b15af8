//! Uniform deviates and the triangular sampler.
//!
//! A non-blank seed string is hashed to a 32-bit integer that seeds
//! [`Mulberry32`]; two runs with the same seed and trial count consume the
//! same stream. Without a seed the stream comes from host entropy.

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};

use super::types::{DiscountRate, TriangularParams};

const TWO_POW_32: f64 = 4_294_967_296.0;
const MULBERRY_INCREMENT: u32 = 0x6D2B_79F5;
const STREAM_SALT: u32 = 0x9E37_79B9;

/// Rolling `h = h * 31 + unit` over the UTF-16 code units, wrapped to 32 bits.
pub fn hash_seed(seed: &str) -> i32 {
    seed.encode_utf16()
        .fold(0_i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Mulberry32: one 32-bit word of state, output scaled by 2^-32 into `[0, 1)`.
#[derive(Debug, Clone)]
pub struct Mulberry32 {
    state: u32,
}

impl Mulberry32 {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(MULBERRY_INCREMENT);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        t ^ (t >> 14)
    }

    pub fn next_f64(&mut self) -> f64 {
        self.next_u32() as f64 / TWO_POW_32
    }
}

/// Source of uniform deviates in `[0, 1)` for one driver.
#[derive(Debug, Clone)]
pub enum UniformSource {
    Seeded(Mulberry32),
    Entropy(StdRng),
}

impl UniformSource {
    pub fn new(seed: Option<&str>) -> Self {
        Self::for_stream(seed, 0)
    }

    /// Independent stream `stream` of the same seed; stream 0 is the plain hash.
    pub fn for_stream(seed: Option<&str>, stream: u32) -> Self {
        match seed.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => {
                let hashed = hash_seed(s) as u32;
                UniformSource::Seeded(Mulberry32::new(
                    hashed ^ stream.wrapping_mul(STREAM_SALT),
                ))
            }
            None => UniformSource::Entropy(StdRng::from_entropy()),
        }
    }

    pub fn is_seeded(&self) -> bool {
        matches!(self, UniformSource::Seeded(_))
    }

    pub fn next_f64(&mut self) -> f64 {
        match self {
            UniformSource::Seeded(rng) => rng.next_f64(),
            UniformSource::Entropy(rng) => rng.r#gen::<f64>(),
        }
    }
}

impl TriangularParams {
    /// Inverse CDF at `u`. Exact for the triangular law; one deviate per sample.
    pub fn sample_with(&self, u: f64) -> f64 {
        if self.is_degenerate() {
            return self.min;
        }
        let width = self.max - self.min;
        let c = (self.mode - self.min) / width;
        if u < c {
            self.min + (u * width * (self.mode - self.min)).sqrt()
        } else {
            self.max - ((1.0 - u) * width * (self.max - self.mode)).sqrt()
        }
    }

    pub fn sample(&self, rng: &mut UniformSource) -> f64 {
        self.sample_with(rng.next_f64())
    }
}

impl DiscountRate {
    /// A fixed rate consumes no deviate.
    pub fn sample(&self, rng: &mut UniformSource) -> f64 {
        match self {
            DiscountRate::Fixed(r) => *r,
            DiscountRate::Triangular(t) => t.sample(rng),
        }
    }
}
