//! Input handling.
//!
//! Produces per-tick movement directions. Real clients would sample a
//! keyboard; the bot uses [`Wander`] to pick random headings.

use std::time::Duration;

use arena_shared::math::Vec3;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Directional input at a moment in time. Axes are in `[-1, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub forward: f32,
    pub right: f32,
}

impl InputState {
    /// Movement direction on the ground plane: `right` is +x, `forward` is +z.
    /// Diagonals are normalized so they are not faster.
    pub fn movement(self) -> Vec3 {
        Vec3::new(self.right, 0.0, self.forward).clamp_len(1.0)
    }
}

/// Random walk: holds a heading for a while, then picks a new one.
#[derive(Debug)]
pub struct Wander {
    rng: StdRng,
    current: InputState,
    hold: Duration,
    held: Duration,
}

impl Wander {
    pub fn new(seed: Option<u64>, hold: Duration) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            current: InputState::default(),
            hold,
            held: hold,
        }
    }

    /// Advances by `dt` and returns the input to send this tick.
    pub fn next(&mut self, dt: Duration) -> InputState {
        self.held += dt;
        if self.held >= self.hold {
            self.held = Duration::ZERO;
            // One heading in five is standing still.
            self.current = if self.rng.gen_bool(0.2) {
                InputState::default()
            } else {
                let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
                InputState {
                    forward: angle.sin(),
                    right: angle.cos(),
                }
            };
        }
        self.current
    }

    /// True with probability `p`.
    pub fn chance(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p.clamp(0.0, 1.0))
    }
}
