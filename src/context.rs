//! Explicit session context.
//!
//! The working graph and its evaluators share one `Context` per session,
//! threaded through calls as an argument. It owns the RNG used by random
//! draw opcodes so runs are reproducible from a seed; there is no
//! process-wide registry.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
pub struct Context {
    pub rng: StdRng,
}

impl Context {
    pub fn new(seed: u64) -> Self {
        Context {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One uniform draw in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new(0)
    }
}
