//! Fighters and the collaborators their motion step reads from and writes to

use tracing::trace;
use uuid::Uuid;

use crate::ws::protocol::FighterSnapshot;

use super::motion::{
    GroundState, InputSample, MotionConfig, MotionIntegrator, MotionState, MotionStep, Vec2,
    SPEED_PARAM,
};

/// Reports ground contact; queried once per tick, never driven
pub trait GroundSensor: Send {
    fn on_ground(&self) -> bool;
    /// Friction coefficient, never negative
    fn friction(&self) -> f32;
}

/// Physics body the motion step commits to
pub trait PhysicsBody: Send {
    fn velocity(&self) -> Vec2;
    fn set_velocity(&mut self, velocity: Vec2);
    /// Reorient about the body's vertical axis
    fn rotate_about_up(&mut self, degrees: f32);
    fn yaw_degrees(&self) -> f32;
}

/// Receives named animation floats; fire and forget
pub trait AnimationSink: Send {
    fn set_float(&mut self, name: &str, value: f32);
}

/// Collaborator binding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("Missing required binding: {0}")]
    Missing(&'static str),
}

/// Level ground that is always in contact
#[derive(Debug, Clone, Copy)]
pub struct FlatGround {
    friction: f32,
}

impl FlatGround {
    pub fn new(friction: f32) -> Self {
        Self {
            friction: friction.max(0.0),
        }
    }
}

impl GroundSensor for FlatGround {
    fn on_ground(&self) -> bool {
        true
    }

    fn friction(&self) -> f32 {
        self.friction
    }
}

/// Body whose velocity is set directly by the simulation
#[derive(Debug, Clone, Copy, Default)]
pub struct KinematicBody {
    velocity: Vec2,
    yaw: f32,
}

impl KinematicBody {
    /// Body at rest with zero yaw
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhysicsBody for KinematicBody {
    fn velocity(&self) -> Vec2 {
        self.velocity
    }

    fn set_velocity(&mut self, velocity: Vec2) {
        self.velocity = velocity;
    }

    fn rotate_about_up(&mut self, degrees: f32) {
        self.yaw = (self.yaw + degrees).rem_euclid(360.0);
    }

    fn yaw_degrees(&self) -> f32 {
        self.yaw
    }
}

/// Animation sink that only emits trace events (the server has no animator)
#[derive(Debug, Clone, Copy)]
pub struct TraceAnimation {
    peer_id: Uuid,
}

impl TraceAnimation {
    pub fn new(peer_id: Uuid) -> Self {
        Self { peer_id }
    }
}

impl AnimationSink for TraceAnimation {
    fn set_float(&mut self, name: &str, value: f32) {
        trace!(peer_id = %self.peer_id, name, value, "Animation float");
    }
}

/// A controlled fighter with its bound collaborators
pub struct Fighter {
    pub peer_id: Uuid,
    config: MotionConfig,
    state: MotionState,
    pending_input: Option<InputSample>,
    last_input_seq: u32,
    last_step: Option<MotionStep>,
    ground: Box<dyn GroundSensor>,
    body: Box<dyn PhysicsBody>,
    animation: Box<dyn AnimationSink>,
}

impl Fighter {
    pub fn builder(peer_id: Uuid) -> FighterBuilder {
        FighterBuilder::new(peer_id)
    }

    pub fn state(&self) -> &MotionState {
        &self.state
    }

    /// Buffer the sample for the next tick. Stale or repeated sequence
    /// numbers are ignored.
    pub fn buffer_input(&mut self, seq: u32, sample: InputSample) -> bool {
        if seq <= self.last_input_seq {
            return false;
        }
        self.last_input_seq = seq;
        self.pending_input = Some(sample);
        true
    }

    /// Run one fixed step, consuming the buffered sample if any
    pub fn tick(&mut self, dt: f32) -> MotionStep {
        let input = self.pending_input.take();
        let ground = GroundState {
            on_ground: self.ground.on_ground(),
            friction: self.ground.friction(),
        };

        let step = MotionIntegrator::step(
            &self.config,
            &mut self.state,
            input,
            ground,
            self.body.velocity(),
            dt,
        );

        if step.flipped {
            self.body.rotate_about_up(180.0);
        }
        self.animation.set_float(SPEED_PARAM, step.animation_speed);
        self.body.set_velocity(step.velocity);

        self.last_step = Some(step);
        step
    }

    pub fn snapshot(&self) -> FighterSnapshot {
        FighterSnapshot {
            peer_id: self.peer_id,
            vel_x: self.state.velocity.x,
            vel_y: self.state.velocity.y,
            facing_right: self.state.facing_right,
            yaw: self.body.yaw_degrees(),
            animation_speed: self.last_step.map(|s| s.animation_speed).unwrap_or(0.0),
            last_input_seq: self.last_input_seq,
        }
    }
}

/// Resolves every collaborator up front so no tick runs unbound
pub struct FighterBuilder {
    peer_id: Uuid,
    config: MotionConfig,
    facing_right: bool,
    ground: Option<Box<dyn GroundSensor>>,
    body: Option<Box<dyn PhysicsBody>>,
    animation: Option<Box<dyn AnimationSink>>,
}

impl FighterBuilder {
    pub fn new(peer_id: Uuid) -> Self {
        Self {
            peer_id,
            config: MotionConfig::default(),
            facing_right: true,
            ground: None,
            body: None,
            animation: None,
        }
    }

    pub fn config(mut self, config: MotionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn facing_right(mut self, facing_right: bool) -> Self {
        self.facing_right = facing_right;
        self
    }

    pub fn ground(mut self, ground: impl GroundSensor + 'static) -> Self {
        self.ground = Some(Box::new(ground));
        self
    }

    pub fn body(mut self, body: impl PhysicsBody + 'static) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    pub fn animation(mut self, animation: impl AnimationSink + 'static) -> Self {
        self.animation = Some(Box::new(animation));
        self
    }

    pub fn build(self) -> Result<Fighter, BindingError> {
        let ground = self.ground.ok_or(BindingError::Missing("ground sensor"))?;
        let body = self.body.ok_or(BindingError::Missing("physics body"))?;
        let animation = self.animation.ok_or(BindingError::Missing("animation sink"))?;

        Ok(Fighter {
            peer_id: self.peer_id,
            config: self.config,
            state: MotionState {
                facing_right: self.facing_right,
                ..MotionState::default()
            },
            pending_input: None,
            last_input_seq: 0,
            last_step: None,
            ground,
            body,
            animation,
        })
    }
}
