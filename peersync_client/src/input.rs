//! Input handling.
//!
//! A real engine polls the keyboard every frame. The sync core only needs the
//! result: which way the player wants to walk, and whether a jump started this
//! frame. [`InputScript`] produces the same thing from a JSON step list, for
//! headless bots and tests.

use std::path::Path;

use anyhow::Context;
use peersync_shared::protocol::Facing;
use serde::Deserialize;

/// Local input for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputSample {
    /// Directional intent; `Idle` when no horizontal key is held.
    pub horizontal: Facing,
    /// Vertical velocity to apply this tick (a jump), if any.
    pub vertical_impulse: Option<f32>,
}

impl InputSample {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn walking(facing: Facing) -> Self {
        Self {
            horizontal: facing,
            vertical_impulse: None,
        }
    }

    #[must_use]
    pub fn with_jump(mut self, velocity: f32) -> Self {
        self.vertical_impulse = Some(velocity);
        self
    }
}

#[derive(Debug, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    looping: bool,
    steps: Vec<ScriptStep>,
}

/// One scripted stretch of input.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptStep {
    /// How many ticks the step lasts. Zero counts as one.
    pub ticks: u32,
    #[serde(default)]
    pub facing: Facing,
    /// Jump on the first tick of the step.
    #[serde(default)]
    pub jump: bool,
}

/// Plays back a list of [`ScriptStep`]s, one sample per tick.
#[derive(Debug, Clone)]
pub struct InputScript {
    steps: Vec<ScriptStep>,
    index: usize,
    tick_in_step: u32,
    looping: bool,
    jump_velocity: f32,
}

impl InputScript {
    pub fn new(steps: Vec<ScriptStep>, looping: bool, jump_velocity: f32) -> anyhow::Result<Self> {
        if steps.is_empty() {
            anyhow::bail!("input script contains no steps");
        }
        Ok(Self {
            steps,
            index: 0,
            tick_in_step: 0,
            looping,
            jump_velocity,
        })
    }

    pub fn from_json_str(s: &str, jump_velocity: f32) -> anyhow::Result<Self> {
        let file: ScriptFile = serde_json::from_str(s).context("parse input script")?;
        Self::new(file.steps, file.looping, jump_velocity)
    }

    pub fn from_path(path: &Path, jump_velocity: f32) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read input script {}", path.display()))?;
        Self::from_json_str(&contents, jump_velocity)
    }

    /// Walk right, stop and jump, walk left, stop and jump; forever.
    pub fn patrol(jump_velocity: f32) -> Self {
        let step = |ticks, facing, jump| ScriptStep {
            ticks,
            facing,
            jump,
        };
        Self {
            steps: vec![
                step(90, Facing::Right, false),
                step(30, Facing::Idle, true),
                step(90, Facing::Left, false),
                step(30, Facing::Idle, true),
            ],
            index: 0,
            tick_in_step: 0,
            looping: true,
            jump_velocity,
        }
    }

    /// Sample for the current tick, then advance.
    pub fn next_sample(&mut self) -> InputSample {
        let Some(step) = self.steps.get(self.index) else {
            return InputSample::idle();
        };

        let mut sample = InputSample::walking(step.facing);
        if step.jump && self.tick_in_step == 0 {
            sample = sample.with_jump(self.jump_velocity);
        }

        self.tick_in_step += 1;
        if self.tick_in_step >= step.ticks.max(1) {
            self.tick_in_step = 0;
            self.index += 1;
            if self.looping && self.index == self.steps.len() {
                self.index = 0;
            }
        }
        sample
    }
}
