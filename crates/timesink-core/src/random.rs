// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Injectable uniform random source used by probabilistic edges and the
//! `looped_almost_done` validator.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub trait RandomSource: Send + Sync {
    /// Returns a fresh uniform draw in `[0, 1)`. Every call is independent.
    fn draw_unit(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn draw_unit(&self) -> f64 {
        OsRng.gen::<f64>()
    }
}

/// Deterministic generator for reproducible branch selection.
pub struct SeededRandom {
    rng: Mutex<ChaCha8Rng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn draw_unit(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

/// Replays a scripted sequence of draws, then repeats the fallback value.
pub struct ScriptedRandom {
    draws: Mutex<VecDeque<f64>>,
    fallback: f64,
}

impl ScriptedRandom {
    pub fn new(draws: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            draws: Mutex::new(draws.into_iter().collect()),
            fallback,
        }
    }

    pub fn remaining(&self) -> usize {
        self.draws.lock().len()
    }
}

impl RandomSource for ScriptedRandom {
    fn draw_unit(&self) -> f64 {
        self.draws.lock().pop_front().unwrap_or(self.fallback)
    }
}
