//! Deterministic horizontal motion for fighters
//!
//! Every peer runs the same step with the same fixed delta, so results are
//! reproducible bit for bit given identical inputs.

use serde::{Deserialize, Serialize};

/// Name of the animation float driven by horizontal speed
pub const SPEED_PARAM: &str = "Speed";

/// 2D vector
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One directional sample per tick per fighter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSample {
    pub horizontal: f32,
}

impl InputSample {
    pub fn new(horizontal: f32) -> Self {
        Self {
            horizontal: horizontal.clamp(-1.0, 1.0),
        }
    }
}

/// Ground contact snapshot for a single tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundState {
    pub on_ground: bool,
    pub friction: f32,
}

/// Movement tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionConfig {
    pub max_speed: f32,
    pub max_ground_acceleration: f32,
    pub max_air_acceleration: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_speed: 4.0,
            max_ground_acceleration: 35.0,
            max_air_acceleration: 20.0,
        }
    }
}

/// Per-fighter motion state, written only by that fighter's own tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionState {
    pub velocity: Vec2,
    pub desired_velocity: Vec2,
    /// Last known input direction; survives ticks without a sample
    pub direction: Vec2,
    pub facing_right: bool,
}

impl Default for MotionState {
    fn default() -> Self {
        Self {
            velocity: Vec2::ZERO,
            desired_velocity: Vec2::ZERO,
            direction: Vec2::ZERO,
            facing_right: true,
        }
    }
}

/// Result of a single motion step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionStep {
    pub velocity: Vec2,
    pub facing_right: bool,
    /// True when the body must turn 180 degrees about its vertical axis
    pub flipped: bool,
    pub animation_speed: f32,
}

/// Move `current` towards `target` by at most `max_delta`, never past it
pub fn move_towards(current: f32, target: f32, max_delta: f32) -> f32 {
    if (target - current).abs() <= max_delta {
        target
    } else {
        current + (target - current).signum() * max_delta
    }
}

/// Motion step function
pub struct MotionIntegrator;

impl MotionIntegrator {
    /// Advance one fixed simulation step.
    ///
    /// `body_velocity` is the body's velocity before the step; only its x
    /// component is driven here. `dt` must be the simulation's fixed step.
    pub fn step(
        config: &MotionConfig,
        state: &mut MotionState,
        input: Option<InputSample>,
        ground: GroundState,
        body_velocity: Vec2,
        dt: f32,
    ) -> MotionStep {
        if let Some(sample) = input {
            state.direction.x = sample.horizontal;
        }

        let speed_cap = (config.max_speed - ground.friction).max(0.0);
        state.desired_velocity = Vec2::new(state.direction.x * speed_cap, 0.0);

        let acceleration = if ground.on_ground {
            config.max_ground_acceleration
        } else {
            config.max_air_acceleration
        };
        let max_step = acceleration * dt;

        state.velocity = body_velocity;
        state.velocity.x = move_towards(state.velocity.x, state.desired_velocity.x, max_step);

        let flipped = (state.direction.x > 0.0 && !state.facing_right)
            || (state.direction.x < 0.0 && state.facing_right);
        if flipped {
            state.facing_right = !state.facing_right;
        }

        MotionStep {
            velocity: state.velocity,
            facing_right: state.facing_right,
            flipped,
            animation_speed: state.velocity.x.abs(),
        }
    }
}
