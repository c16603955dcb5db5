//! Seeded random number source for the `random` opcode.
//!
//! Stories re-seed mid-game (`random` with a non-positive argument), and
//! the snapshot format has to carry the generator state across
//! freeze/thaw, so the game-visible stream comes from a self-contained
//! xorshift64* whose whole state is one non-zero u64. OS entropy (via
//! `rand`) is only used when a story asks for an unpredictable re-seed.

use rand::Rng;

pub struct ZRand {
    state: u64,
}

impl ZRand {
    /// Start from OS entropy.
    pub fn new_uniform() -> ZRand {
        ZRand::new_seeded(rand::thread_rng().gen())
    }

    /// Start from a fixed seed (predictable mode, used by tests and the
    /// `--seed` flag).
    pub fn new_seeded(seed: u64) -> ZRand {
        let mut rng = ZRand { state: 0 };
        rng.seed(seed);
        rng
    }

    /// Re-seed in place. A zero seed is remapped; xorshift state must be
    /// non-zero.
    pub fn seed(&mut self, seed: u64) {
        self.state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
    }

    pub fn reseed_uniform(&mut self) {
        self.seed(rand::thread_rng().gen());
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform value in `1..=range`. `range` must be positive.
    pub fn gen_range(&mut self, range: u16) -> u16 {
        debug_assert!(range > 0);
        1 + (self.next_u64() % range as u64) as u16
    }

    /// Generator state as a language-neutral integer pair (high word,
    /// low word) for the snapshot format.
    pub fn state(&self) -> [u32; 2] {
        [(self.state >> 32) as u32, self.state as u32]
    }

    pub fn set_state(&mut self, state: [u32; 2]) {
        self.seed(((state[0] as u64) << 32) | state[1] as u64);
    }
}
