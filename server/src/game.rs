use crate::physics::{Body, Vector2};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Color, ConnectionId, EntityKind, EntityUpdate, InputSnapshot};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub const BOARD_HALF_WIDTH: f32 = 20.0;
pub const BOARD_HALF_HEIGHT: f32 = 15.0;
pub const PLAYER_RADIUS: f32 = 0.5;
pub const MOVE_FORCE: f32 = 40.0;
pub const PICKUP_RADIUS: f32 = 0.3;
pub const PICKUP_COUNT: usize = 5;

const PICKUP_COLOR: Color = Color::new(255, 215, 0);

/// What the tick loop drives. Only the tick loop holds a `&mut`, so
/// implementations need no interior locking.
pub trait Simulation: Send + 'static {
    fn add_player(&mut self, id: ConnectionId, nickname: String, color: Color);

    /// Returns whether a player was actually removed
    fn remove_player(&mut self, id: &ConnectionId) -> bool;

    /// Replaces the held keys for `id`; unknown ids are ignored
    fn set_input(&mut self, id: &ConnectionId, input: InputSnapshot);

    fn advance(&mut self, dt: Duration);

    fn snapshot(&self) -> Vec<EntityUpdate>;

    fn has_player(&self, id: &ConnectionId) -> bool;
}

#[derive(Debug, Clone)]
struct PlayerEntity {
    body: Body,
    input: InputSnapshot,
    score: i32,
    name: String,
    color: Color,
}

#[derive(Debug, Clone)]
struct Pickup {
    id: Uuid,
    position: Vector2,
    value: i32,
}

/// Reference board: players push themselves around with held keys and
/// collect score pickups that respawn elsewhere when taken.
#[derive(Debug)]
pub struct GameBoard {
    pub tick: u64,
    players: HashMap<ConnectionId, PlayerEntity>,
    pickups: Vec<Pickup>,
    rng: StdRng,
}

impl GameBoard {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic board for tests
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let mut board = Self {
            tick: 0,
            players: HashMap::new(),
            pickups: Vec::with_capacity(PICKUP_COUNT),
            rng,
        };
        for _ in 0..PICKUP_COUNT {
            let pickup = Pickup {
                id: Uuid::new_v4(),
                position: board.random_position(PICKUP_RADIUS),
                value: board.random_value(),
            };
            board.pickups.push(pickup);
        }
        board
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn score_of(&self, id: &ConnectionId) -> Option<i32> {
        self.players.get(id).map(|player| player.score)
    }

    pub fn position_of(&self, id: &ConnectionId) -> Option<Vector2> {
        self.players.get(id).map(|player| player.body.position)
    }

    fn random_position(&mut self, radius: f32) -> Vector2 {
        Vector2::new(
            self.rng
                .gen_range(-BOARD_HALF_WIDTH + radius..BOARD_HALF_WIDTH - radius),
            self.rng
                .gen_range(-BOARD_HALF_HEIGHT + radius..BOARD_HALF_HEIGHT - radius),
        )
    }

    fn random_value(&mut self) -> i32 {
        self.rng.gen_range(1..=3) * 5
    }

    fn collect_pickups(&mut self) {
        for index in 0..self.pickups.len() {
            let position = self.pickups[index].position;
            let collector = self
                .players
                .iter_mut()
                .find(|(_, player)| player.body.touches(&position, PICKUP_RADIUS));

            if let Some((id, player)) = collector {
                player.score += self.pickups[index].value;
                debug!("Player {} collected a pickup, score {}", id, player.score);

                let position = self.random_position(PICKUP_RADIUS);
                let value = self.random_value();
                let pickup = &mut self.pickups[index];
                pickup.position = position;
                pickup.value = value;
            }
        }
    }
}

impl Default for GameBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation for GameBoard {
    fn add_player(&mut self, id: ConnectionId, nickname: String, color: Color) {
        let spawn = self.random_position(PLAYER_RADIUS);
        info!(
            "Added player {} ({}) at ({:.1}, {:.1})",
            nickname, id, spawn.x, spawn.y
        );
        self.players.insert(
            id,
            PlayerEntity {
                body: Body::at(spawn, PLAYER_RADIUS),
                input: InputSnapshot::default(),
                score: 0,
                name: nickname,
                color,
            },
        );
    }

    fn remove_player(&mut self, id: &ConnectionId) -> bool {
        let removed = self.players.remove(id).is_some();
        if removed {
            info!("Removed player {}", id);
        }
        removed
    }

    fn set_input(&mut self, id: &ConnectionId, input: InputSnapshot) {
        if let Some(player) = self.players.get_mut(id) {
            player.input = input;
        }
    }

    fn advance(&mut self, dt: Duration) {
        let dt = dt.as_secs_f32();
        self.tick += 1;

        for player in self.players.values_mut() {
            let (x, y) = player.input.axis();
            let force = Vector2::new(x, y).normalize().scale(MOVE_FORCE);
            player.body.simulate(force, dt);
            player.body.clamp_to(BOARD_HALF_WIDTH, BOARD_HALF_HEIGHT);
        }

        self.collect_pickups();
    }

    fn snapshot(&self) -> Vec<EntityUpdate> {
        let players = self.players.iter().map(|(id, player)| EntityUpdate {
            entity_id: id.uuid(),
            x: player.body.position.x,
            y: player.body.position.y,
            kind: EntityKind::Player {
                score: player.score,
                name: player.name.clone(),
                color: player.color,
            },
        });

        let pickups = self.pickups.iter().map(|pickup| EntityUpdate {
            entity_id: pickup.id,
            x: pickup.position.x,
            y: pickup.position.y,
            kind: EntityKind::Score {
                score: pickup.value,
                color: PICKUP_COLOR,
            },
        });

        players.chain(pickups).collect()
    }

    fn has_player(&self, id: &ConnectionId) -> bool {
        self.players.contains_key(id)
    }
}
