//! Entity registry.
//!
//! Players live in a fixed table of slots indexed by [`PlayerId`]; allocation
//! is a linear scan for the first empty slot and freeing clears in place.
//! Dummies live in an ordered list with ids that are never reused.
//!
//! Every entity owns exactly one physics actor for as long as it exists. The
//! registry owns the physics backend and releases all actors before the
//! backend is dropped.

use std::f32::consts::TAU;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{
    config::ServerConfig,
    math::{Color, Vec3},
    net::{DummyState, GameState, PlayerState},
    physics::{ActorTag, PhysicsBackend},
};

/// Slot index of a player.
pub type PlayerId = u32;

/// Id of a dummy entity.
pub type DummyId = u64;

/// Input vector to horizontal speed.
pub const PLAYER_MOVE_SPEED: f32 = 12.0;

/// Radius of the player spawn ring.
pub const SPAWN_RING_RADIUS: f32 = 8.0;

/// Height players spawn at.
pub const PLAYER_SPAWN_HEIGHT: f32 = 1.0;

/// Height dummies spawn at.
pub const DUMMY_SPAWN_HEIGHT: f32 = 2.0;

/// Fraction of the map half-extent dummies spawn within.
pub const DUMMY_SPAWN_SPREAD: f32 = 0.35;

/// Collision radius reported for dummies.
pub const DUMMY_RADIUS: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("Server is full ({capacity}/{capacity} players)")]
    Full { capacity: usize },
}

/// A joined player.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: PlayerId,
    pub nickname: String,
    pub position: Vec3,
    pub velocity: Vec3,
    pub color: Color,
    /// Movement intent; overwritten, never accumulated.
    pub input: Vec3,
    pub active: bool,
}

/// A physics-driven prop.
#[derive(Debug, Clone, PartialEq)]
pub struct DummyEntity {
    pub id: DummyId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub radius: f32,
}

/// Registry settings derived from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct WorldConfig {
    pub capacity: usize,
    /// Live dummies allowed at once.
    pub max_dummies: usize,
    pub map_half_extent: f32,
    pub seed: Option<u64>,
}

impl From<&ServerConfig> for WorldConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            capacity: cfg.player_slots(),
            max_dummies: cfg.dummy_limit(),
            map_half_extent: cfg.map_half_extent,
            seed: cfg.seed,
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        (&ServerConfig::default()).into()
    }
}

/// Players, dummies, and the physics world backing them.
pub struct EntityRegistry {
    players: Vec<Option<Player>>,
    dummies: Vec<DummyEntity>,
    next_dummy_id: DummyId,
    max_dummies: usize,
    map_half_extent: f32,
    rng: StdRng,
    physics: Box<dyn PhysicsBackend>,
}

impl EntityRegistry {
    pub fn new(cfg: WorldConfig, physics: Box<dyn PhysicsBackend>) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            players: vec![None; cfg.capacity],
            dummies: Vec::new(),
            next_dummy_id: 0,
            max_dummies: cfg.max_dummies,
            map_half_extent: cfg.map_half_extent,
            rng,
            physics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.players.len()
    }

    /// Spawn point for a slot: evenly spaced on a ring around the origin.
    pub fn spawn_position(&self, id: PlayerId) -> Vec3 {
        let angle = id as f32 * TAU / self.capacity() as f32;
        Vec3::new(
            angle.cos() * SPAWN_RING_RADIUS,
            PLAYER_SPAWN_HEIGHT,
            angle.sin() * SPAWN_RING_RADIUS,
        )
    }

    /// Places a player in the first free slot.
    pub fn add_player(&mut self, nickname: &str, color: Color) -> Result<PlayerId, WorldError> {
        let Some(slot) = self.players.iter().position(Option::is_none) else {
            debug!(capacity = self.capacity(), "No available slots");
            return Err(WorldError::Full {
                capacity: self.capacity(),
            });
        };
        let id = slot as PlayerId;
        let position = self.spawn_position(id);

        self.physics.create_actor(ActorTag::Player(id), position);
        self.players[slot] = Some(Player {
            id,
            nickname: nickname.to_string(),
            position,
            velocity: Vec3::ZERO,
            color,
            input: Vec3::ZERO,
            active: true,
        });

        info!(player_id = id, nickname = %nickname, "Player slot assigned");
        Ok(id)
    }

    /// Frees a slot. Returns `false` if there was nothing to free.
    pub fn remove_player(&mut self, id: PlayerId) -> bool {
        let Some(slot) = self.players.get_mut(id as usize) else {
            return false;
        };
        let Some(player) = slot.take() else {
            return false;
        };
        self.physics.remove_actor(ActorTag::Player(id));
        info!(player_id = id, nickname = %player.nickname, "Player slot freed");
        true
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(id as usize).and_then(Option::as_ref)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.iter().flatten()
    }

    pub fn player_count(&self) -> usize {
        self.players().count()
    }

    /// Overwrites a player's movement intent. Non-finite vectors are dropped
    /// so they never reach physics or a snapshot.
    pub fn set_player_input(&mut self, id: PlayerId, movement: Vec3) {
        if !movement.is_finite() {
            debug!(player_id = id, ?movement, "Dropped non-finite input");
            return;
        }
        if let Some(Some(player)) = self.players.get_mut(id as usize) {
            player.input = movement;
        }
    }

    /// Asks physics for a jump. Returns whether it happened.
    pub fn request_jump(&mut self, id: PlayerId) -> bool {
        if self.player(id).is_none() {
            return false;
        }
        self.physics.jump(ActorTag::Player(id))
    }

    /// Spawns up to `count` dummies at random spots near the centre. Stops at
    /// the dummy cap; the returned ids are the ones actually spawned.
    pub fn spawn_dummies(&mut self, count: usize) -> Vec<DummyId> {
        let room = self.max_dummies.saturating_sub(self.dummies.len());
        if count > room {
            debug!(requested = count, room, "Dummy spawn capped");
        }
        let count = count.min(room);
        let spread = self.map_half_extent * DUMMY_SPAWN_SPREAD;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let position = Vec3::new(
                self.rng.gen_range(-spread..=spread),
                DUMMY_SPAWN_HEIGHT,
                self.rng.gen_range(-spread..=spread),
            );
            let id = self.next_dummy_id;
            self.next_dummy_id += 1;

            self.physics.create_actor(ActorTag::Dummy(id), position);
            self.dummies.push(DummyEntity {
                id,
                position,
                velocity: Vec3::ZERO,
                radius: DUMMY_RADIUS,
            });
            ids.push(id);
        }
        debug!(count, total = self.dummies.len(), "Dummies spawned");
        ids
    }

    /// Removes every dummy. Returns how many were removed.
    pub fn delete_all_dummies(&mut self) -> usize {
        let removed = self.dummies.len();
        for dummy in self.dummies.drain(..) {
            self.physics.remove_actor(ActorTag::Dummy(dummy.id));
        }
        debug!(removed, "Dummies deleted");
        removed
    }

    pub fn dummies(&self) -> &[DummyEntity] {
        &self.dummies
    }

    pub fn dummy_count(&self) -> usize {
        self.dummies.len()
    }

    pub fn max_dummies(&self) -> usize {
        self.max_dummies
    }

    /// One simulation step: push all inputs, step physics, pull all state.
    pub fn advance(&mut self, dt_sec: f32) {
        for player in self.players.iter().flatten().filter(|p| p.active) {
            let desired = Vec3::new(
                player.input.x * PLAYER_MOVE_SPEED,
                0.0,
                player.input.z * PLAYER_MOVE_SPEED,
            );
            self.physics
                .set_horizontal_velocity(ActorTag::Player(player.id), desired);
        }

        self.physics.step(dt_sec);

        for player in self.players.iter_mut().flatten() {
            let tag = ActorTag::Player(player.id);
            if let (Some(p), Some(v)) = (self.physics.position(tag), self.physics.velocity(tag)) {
                player.position = p;
                player.velocity = v;
            }
        }
        for dummy in &mut self.dummies {
            let tag = ActorTag::Dummy(dummy.id);
            if let (Some(p), Some(v)) = (self.physics.position(tag), self.physics.velocity(tag)) {
                dummy.position = p;
                dummy.velocity = v;
            }
        }
    }

    /// Point-in-time wire view of every live entity.
    pub fn snapshot(&self) -> GameState {
        GameState {
            players: self
                .players()
                .map(|p| PlayerState {
                    id: p.id,
                    nickname: p.nickname.clone(),
                    pos: p.position.to_array(),
                    vel: p.velocity.to_array(),
                    color: p.color.to_array(),
                })
                .collect(),
            dummies: self
                .dummies
                .iter()
                .map(|d| DummyState {
                    id: d.id,
                    pos: d.position.to_array(),
                })
                .collect(),
        }
    }

    /// Number of live physics actors; equals players plus dummies.
    pub fn actor_count(&self) -> usize {
        self.physics.actor_count()
    }
}

impl Drop for EntityRegistry {
    fn drop(&mut self) {
        let players: Vec<PlayerId> = self.players().map(|p| p.id).collect();
        for id in players {
            self.remove_player(id);
        }
        self.delete_all_dummies();
        debug!(
            remaining = self.physics.actor_count(),
            "Registry released all actors"
        );
    }
}
