//! Physics abstraction.
//!
//! The registry talks to physics only through [`PhysicsBackend`]: actor
//! lifecycle, a horizontal velocity command, a gated jump impulse, a world
//! step, and position/velocity queries. Actors are addressed by [`ActorTag`].
//!
//! [`SimplePhysics`] is a small point-mass backend: gravity, a ground plane at
//! `y = 0`, linear damping, a speed clamp, and pairwise push-apart between
//! actors. It is deterministic for a given seed and call sequence.

use std::collections::BTreeMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace};

use crate::{
    math::Vec3,
    world::{DummyId, PlayerId},
};

/// Identity of a physics actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActorTag {
    Player(PlayerId),
    Dummy(DummyId),
}

/// Physics stepper contract.
pub trait PhysicsBackend: Send {
    /// Creates a dynamic actor. Player actors get character tuning, dummy
    /// actors get lighter tuning plus periodic auto-hops.
    fn create_actor(&mut self, tag: ActorTag, position: Vec3);

    /// Removes an actor. Returns `false` if it did not exist.
    fn remove_actor(&mut self, tag: ActorTag) -> bool;

    /// Sets the x/z velocity; the vertical component is left alone.
    fn set_horizontal_velocity(&mut self, tag: ActorTag, velocity: Vec3);

    /// Applies a jump impulse if the backend deems the actor grounded.
    fn jump(&mut self, tag: ActorTag) -> bool;

    /// Advances the world. Implementations clamp `dt_sec` to [`MAX_STEP`].
    fn step(&mut self, dt_sec: f32);

    fn position(&self, tag: ActorTag) -> Option<Vec3>;

    fn velocity(&self, tag: ActorTag) -> Option<Vec3>;

    fn actor_count(&self) -> usize;
}

/// Nominal simulation step.
pub const FIXED_STEP: f32 = 1.0 / 60.0;

/// Largest step a single `step` call integrates.
pub const MAX_STEP: f32 = FIXED_STEP * 2.0;

/// Half-extent of every actor's collision box.
pub const ACTOR_HALF_EXTENT: f32 = 0.5;

/// Per-kind body tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyTuning {
    pub mass: f32,
    pub linear_damping: f32,
    pub max_speed: f32,
    /// Impulse applied upward on a jump (N·s).
    pub jump_impulse: f32,
    /// Actor must be below this height to jump.
    pub jump_max_height: f32,
}

impl BodyTuning {
    pub const PLAYER: Self = Self {
        mass: 15.0,
        linear_damping: 0.5,
        max_speed: 20.0,
        jump_impulse: 150.0,
        jump_max_height: 2.0,
    };

    pub const DUMMY: Self = Self {
        mass: 5.0,
        linear_damping: 0.3,
        max_speed: 20.0,
        jump_impulse: 50.0,
        jump_max_height: 1.0,
    };
}

/// Physics parameters.
#[derive(Debug, Clone, Copy)]
pub struct PhysicsConfig {
    pub gravity: Vec3,
    /// Vertical speed below which an actor counts as resting.
    pub grounded_speed: f32,
    /// Seconds between dummy auto-hops while grounded.
    pub dummy_hop_interval: f32,
    /// Fraction of normal speed kept on ground/actor impact.
    pub restitution: f32,
    /// Impacts slower than this do not bounce.
    pub bounce_threshold: f32,
    pub seed: Option<u64>,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            grounded_speed: 0.5,
            dummy_hop_interval: 1.0,
            restitution: 0.5,
            bounce_threshold: 2.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Body {
    tuning: BodyTuning,
    position: Vec3,
    velocity: Vec3,
    /// Only dummies carry a hop timer.
    hop_timer: Option<f32>,
}

impl Body {
    fn inv_mass(&self) -> f32 {
        1.0 / self.tuning.mass
    }
}

/// Point-mass physics with a ground plane.
pub struct SimplePhysics {
    cfg: PhysicsConfig,
    bodies: BTreeMap<ActorTag, Body>,
    rng: StdRng,
}

impl SimplePhysics {
    /// Creates the backend. Fails on a config that cannot be simulated.
    pub fn new(cfg: PhysicsConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            cfg.gravity.len_sq().is_finite(),
            "gravity must be finite, got {:?}",
            cfg.gravity
        );
        anyhow::ensure!(
            cfg.dummy_hop_interval > 0.0,
            "dummy_hop_interval must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&cfg.restitution),
            "restitution must be within [0, 1]"
        );
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        debug!(gravity = ?cfg.gravity, "Physics world created");
        Ok(Self {
            cfg,
            bodies: BTreeMap::new(),
            rng,
        })
    }

    fn grounded(&self, body: &Body) -> bool {
        body.velocity.y.abs() < self.cfg.grounded_speed
            && body.position.y < body.tuning.jump_max_height
    }

    fn hop_dummies(&mut self, dt: f32) {
        let grounded_speed = self.cfg.grounded_speed;
        let interval = self.cfg.dummy_hop_interval;
        for body in self.bodies.values_mut() {
            let Some(timer) = body.hop_timer.as_mut() else {
                continue;
            };
            let grounded = body.velocity.y.abs() < grounded_speed
                && body.position.y < body.tuning.jump_max_height;
            // Timer is frozen while airborne.
            if !grounded {
                continue;
            }
            *timer += dt;
            if *timer >= interval {
                *timer = 0.0;
                body.velocity.y += body.tuning.jump_impulse / body.tuning.mass;
            }
        }
    }

    fn integrate(&mut self, dt: f32) {
        let gravity = self.cfg.gravity;
        let restitution = self.cfg.restitution;
        let bounce_threshold = self.cfg.bounce_threshold;
        for body in self.bodies.values_mut() {
            let mut v = body.velocity + gravity * dt;
            v = v * (1.0 - body.tuning.linear_damping * dt).max(0.0);
            v = v.clamp_len(body.tuning.max_speed);
            body.position += v * dt;

            if body.position.y < ACTOR_HALF_EXTENT {
                body.position.y = ACTOR_HALF_EXTENT;
                if v.y < 0.0 {
                    v.y = if -v.y > bounce_threshold {
                        -v.y * restitution
                    } else {
                        0.0
                    };
                }
            }
            body.velocity = v;
        }
    }

    /// Pushes overlapping actor boxes apart along the axis of least overlap
    /// and exchanges momentum along that axis.
    fn resolve_contacts(&mut self) {
        let tags: Vec<ActorTag> = self.bodies.keys().copied().collect();
        let size = ACTOR_HALF_EXTENT * 2.0;
        for (i, a_tag) in tags.iter().enumerate() {
            for b_tag in &tags[i + 1..] {
                let (Some(a), Some(b)) = (self.bodies.get(a_tag), self.bodies.get(b_tag)) else {
                    continue;
                };
                let d = b.position - a.position;
                let overlap = Vec3::new(
                    size - d.x.abs(),
                    size - d.y.abs(),
                    size - d.z.abs(),
                );
                if overlap.x <= 0.0 || overlap.y <= 0.0 || overlap.z <= 0.0 {
                    continue;
                }

                let normal = if overlap.x <= overlap.y && overlap.x <= overlap.z {
                    Vec3::new(d.x.signum(), 0.0, 0.0)
                } else if overlap.y <= overlap.z {
                    Vec3::new(0.0, d.y.signum(), 0.0)
                } else {
                    Vec3::new(0.0, 0.0, d.z.signum())
                };
                let depth = overlap.dot(Vec3::new(
                    normal.x.abs(),
                    normal.y.abs(),
                    normal.z.abs(),
                ));

                let (inv_a, inv_b) = (a.inv_mass(), b.inv_mass());
                let inv_sum = inv_a + inv_b;
                let rel = (b.velocity - a.velocity).dot(normal);
                let impulse = if rel < 0.0 {
                    -(1.0 + self.cfg.restitution) * rel / inv_sum
                } else {
                    0.0
                };

                if let Some(a) = self.bodies.get_mut(a_tag) {
                    a.position = a.position - normal * (depth * inv_a / inv_sum);
                    a.velocity = a.velocity - normal * (impulse * inv_a);
                }
                if let Some(b) = self.bodies.get_mut(b_tag) {
                    b.position += normal * (depth * inv_b / inv_sum);
                    b.velocity += normal * (impulse * inv_b);
                }
            }
        }

        for body in self.bodies.values_mut() {
            body.position.y = body.position.y.max(ACTOR_HALF_EXTENT);
        }
    }
}

impl PhysicsBackend for SimplePhysics {
    fn create_actor(&mut self, tag: ActorTag, position: Vec3) {
        let (tuning, hop_timer) = match tag {
            ActorTag::Player(_) => (BodyTuning::PLAYER, None),
            // Random phase so a freshly spawned group does not hop in unison.
            ActorTag::Dummy(_) => (
                BodyTuning::DUMMY,
                Some(self.rng.gen_range(0.0..self.cfg.dummy_hop_interval)),
            ),
        };
        let body = Body {
            tuning,
            position,
            velocity: Vec3::ZERO,
            hop_timer,
        };
        if self.bodies.insert(tag, body).is_some() {
            debug!(?tag, "Replaced existing actor");
        }
        trace!(?tag, ?position, "Actor created");
    }

    fn remove_actor(&mut self, tag: ActorTag) -> bool {
        let removed = self.bodies.remove(&tag).is_some();
        if removed {
            trace!(?tag, "Actor removed");
        }
        removed
    }

    fn set_horizontal_velocity(&mut self, tag: ActorTag, velocity: Vec3) {
        if let Some(body) = self.bodies.get_mut(&tag) {
            body.velocity.x = velocity.x;
            body.velocity.z = velocity.z;
        }
    }

    fn jump(&mut self, tag: ActorTag) -> bool {
        let Some(body) = self.bodies.get(&tag) else {
            return false;
        };
        if !self.grounded(body) {
            return false;
        }
        if let Some(body) = self.bodies.get_mut(&tag) {
            body.velocity.y += body.tuning.jump_impulse / body.tuning.mass;
        }
        debug!(?tag, "Actor jumped");
        true
    }

    fn step(&mut self, dt_sec: f32) {
        let dt = dt_sec.clamp(0.0, MAX_STEP);
        if dt == 0.0 {
            return;
        }
        self.hop_dummies(dt);
        self.integrate(dt);
        self.resolve_contacts();
    }

    fn position(&self, tag: ActorTag) -> Option<Vec3> {
        self.bodies.get(&tag).map(|b| b.position)
    }

    fn velocity(&self, tag: ActorTag) -> Option<Vec3> {
        self.bodies.get(&tag).map(|b| b.velocity)
    }

    fn actor_count(&self) -> usize {
        self.bodies.len()
    }
}
