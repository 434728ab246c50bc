//! Core simulation engine for the photonlife particle system.
//!
//! A fixed-size population of autonomous particles whose motion, color, and
//! behavioral traits are continuously derived from a per-frame audio feature
//! sample and from flocking interactions with spatial neighbors. The host
//! render loop drives [`ParticleSystem::tick`] once per frame and reads the
//! flat position/color buffers back; nothing here performs I/O.

use ordered_float::OrderedFloat;
use photonlife_index::{IndexError, NeighborhoodIndex, UniformGridIndex};
use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

/// Number of frequency bins a full audio sample is expected to carry.
pub const BAND_COUNT: usize = 8;

/// Lower clamp applied to particle energy.
pub const ENERGY_MIN: f32 = 10.0;
/// Upper clamp applied to particle energy.
pub const ENERGY_MAX: f32 = 200.0;

// Flocking reach and gains. The cohesion radius bounds every neighbor query.
const NEIGHBOR_RADIUS: f32 = 3.0;
const SEPARATION_RADIUS: f32 = 1.0;
const ALIGNMENT_RADIUS: f32 = 2.0;
const COHESION_RADIUS: f32 = 3.0;
const SEPARATION_GAIN: f32 = 0.005;
const ALIGNMENT_GAIN: f32 = 0.002;
const COHESION_GAIN: f32 = 0.001;

// Music force shaping.
const MUSIC_BASS_GAIN: f32 = 0.0075;
const MUSIC_MID_GAIN: f32 = 0.0035;
const MUSIC_TREBLE_GAIN: f32 = 0.002;
const MID_POSITION_COUPLING: f32 = 0.15;
const TREBLE_PHASE_RATE: f32 = 4.0;

// Flow pattern shaping.
const SPIRAL_GAIN: f32 = 0.006;
const SPIRAL_LIFT_GAIN: f32 = 0.0015;
const WAVE_GAIN: f32 = 0.004;
const ATTRACTOR_GAIN: f32 = 0.006;
const ATTRACTOR_REACH: f32 = 0.6;
const SWARM_GAIN: f32 = 0.002;
const SWARM_GENERATION_PHASE: f32 = 0.7;

// Integration and boundary handling.
const BOUNCE_DAMPING: f32 = 0.8;

// Energy model.
const ENERGY_GAIN: f32 = 2.0;
const ENERGY_DECAY: f32 = 0.1;

// Trait drift thresholds on combined music intensity.
const INTENSITY_HIGH: f32 = 0.7;
const INTENSITY_LOW: f32 = 0.3;

// Evolution pressure thresholds.
const EVOLUTION_ENERGY_HIGH: f32 = 150.0;
const EVOLUTION_ENERGY_LOW: f32 = 50.0;

// Color dynamics. Each band pulls hue toward its anchor.
const HUE_BASS: f32 = 240.0;
const HUE_MID: f32 = 120.0;
const HUE_TREBLE: f32 = 0.0;
const HUE_DRIFT_GAIN: f32 = 0.02;
const HUE_DIFFUSION_BLEND: f32 = 0.02;

const BAND_SMOOTHING: f32 = 0.35;
const DISTANCE_EPSILON: f32 = 1e-6;

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Clamp into `[min, max]`, mapping non-finite input to `min`.
fn finite_clamped(value: f32, min: f32, max: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        min
    }
}

fn wrap_hue(hue: f32) -> f32 {
    hue.rem_euclid(360.0)
}

/// Signed shortest arc from `from` to `to` on the hue circle, in `(-180, 180]`.
fn shortest_hue_arc(from: f32, to: f32) -> f32 {
    let diff = (to - from).rem_euclid(360.0);
    if diff > 180.0 { diff - 360.0 } else { diff }
}

/// Convert an HSL triple to linear RGB components in `[0, 1]`.
fn hsl_to_rgb(hue: f32, saturation: f32, lightness: f32) -> [f32; 3] {
    let hue = wrap_hue(hue);
    let c = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let x = c * (1.0 - ((hue / 60.0).rem_euclid(2.0) - 1.0).abs());
    let m = lightness - c * 0.5;

    let (r, g, b) = if hue < 60.0 {
        (c, x, 0.0)
    } else if hue < 120.0 {
        (x, c, 0.0)
    } else if hue < 180.0 {
        (0.0, c, x)
    } else if hue < 240.0 {
        (0.0, x, c)
    } else if hue < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    [clamp01(r + m), clamp01(g + m), clamp01(b + m)]
}

/// High level simulation clock (ticks processed since construction).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Intra-lifetime adaptation counter; advances when the evolution trigger fires.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Generation(pub u32);

impl Generation {
    /// Advances to the next generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// 3-D vector used for positions, velocities, and forces.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Construct a new vector.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean length.
    #[must_use]
    pub fn length_squared(self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Euclidean length.
    #[must_use]
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Per-frame audio feature bundle supplied by the host's analysis layer.
///
/// Fields may arrive degenerate (non-finite, out of range, short `bands`);
/// the clamped accessors are the only way the engine reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    /// Overall loudness in `[0, 100]`.
    pub volume: f32,
    /// Tempo estimate in beats per minute.
    pub tempo: f32,
    /// Dominant pitch in Hz.
    pub pitch: f32,
    /// Frequency-bin magnitudes in `[0, 1]`; eight or more bins expected.
    pub bands: Vec<f32>,
}

impl AudioFeatures {
    /// A silent sample: no volume, neutral tempo and pitch, no band data.
    #[must_use]
    pub fn silence() -> Self {
        Self {
            volume: 0.0,
            tempo: 120.0,
            pitch: 440.0,
            bands: Vec::new(),
        }
    }

    /// Volume clamped into `[0, 100]`.
    #[must_use]
    pub fn clamped_volume(&self) -> f32 {
        finite_clamped(self.volume, 0.0, 100.0)
    }

    /// Tempo in BPM; non-positive or non-finite values fall back to 120.
    #[must_use]
    pub fn clamped_tempo(&self) -> f32 {
        if self.tempo.is_finite() && self.tempo > 0.0 {
            self.tempo
        } else {
            120.0
        }
    }

    /// Pitch in Hz; non-positive or non-finite values fall back to 440.
    #[must_use]
    pub fn clamped_pitch(&self) -> f32 {
        if self.pitch.is_finite() && self.pitch > 0.0 {
            self.pitch
        } else {
            440.0
        }
    }

    /// Band magnitude at `idx`, clamped into `[0, 1]`; 0 when absent.
    #[must_use]
    pub fn band(&self, idx: usize) -> f32 {
        finite_clamped(self.bands.get(idx).copied().unwrap_or(0.0), 0.0, 1.0)
    }
}

impl Default for AudioFeatures {
    fn default() -> Self {
        Self::silence()
    }
}

/// Smoothed band influence plus tempo-locked rhythm phase; the per-particle
/// cache of the band analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BandInfluence {
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
    /// Tempo-synchronized phase in `[0, 2π)`.
    pub rhythm_phase: f32,
}

impl BandInfluence {
    /// Analyze one audio sample at the given simulated age.
    ///
    /// With eight or more bins the influences are bin averages; otherwise a
    /// coarse estimator distributes volume across the bands according to
    /// which pitch range the sample sits in.
    #[must_use]
    pub fn analyze(sample: &AudioFeatures, age: f32) -> Self {
        let (bass, mid, treble) = if sample.bands.len() >= BAND_COUNT {
            (
                (sample.band(0) + sample.band(1)) / 2.0,
                (sample.band(3) + sample.band(4) + sample.band(5)) / 3.0,
                (sample.band(6) + sample.band(7)) / 2.0,
            )
        } else {
            let volume = sample.clamped_volume() / 100.0;
            let pitch = sample.clamped_pitch();
            let (bass_w, mid_w, treble_w) = if pitch < 300.0 {
                (0.8, 0.3, 0.1)
            } else if pitch <= 800.0 {
                (0.3, 0.8, 0.2)
            } else {
                (0.1, 0.3, 0.8)
            };
            (volume * bass_w, volume * mid_w, volume * treble_w)
        };

        let rhythm_phase = (age * (sample.clamped_tempo() / 120.0) * 2.0).rem_euclid(TAU);

        Self {
            bass,
            mid,
            treble,
            rhythm_phase,
        }
    }

    /// Hue anchor of whichever band currently dominates.
    #[must_use]
    pub fn dominant_hue(&self) -> f32 {
        if self.bass >= self.mid && self.bass >= self.treble {
            HUE_BASS
        } else if self.mid >= self.treble {
            HUE_MID
        } else {
            HUE_TREBLE
        }
    }

    /// Mean of the three band influences.
    #[must_use]
    pub fn drive(&self) -> f32 {
        (self.bass + self.mid + self.treble) / 3.0
    }
}

/// Which third of the rhythm cycle selects which attractor point.
///
/// The selection is a pure function of the phase so hosts and tests can
/// predict it: phases in `[0, 2π/3)` map to slot 0, and so on.
#[must_use]
pub fn attractor_slot(rhythm_phase: f32) -> usize {
    let normalized = rhythm_phase.rem_euclid(TAU);
    ((normalized / (TAU / 3.0)) as usize).min(2)
}

/// Motion archetype applied as a deterministic force term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowPattern {
    /// Low-amplitude oscillation with generation-dependent phase offsets.
    #[default]
    Swarm,
    /// Circular motion in the XY plane with bass-driven radius.
    Spiral,
    /// Traveling sinusoid whose wavelength shrinks with mid intensity.
    Wave,
    /// Pull toward one of three orbiting points chosen by rhythm phase.
    Attractor,
}

/// Heritable behavioral parameters. Every scalar stays in `[0, 1]` by
/// construction: the only mutation paths are the saturating drift helpers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraitSet {
    flow_pattern: FlowPattern,
    sociability: f32,
    energy_efficiency: f32,
    color_evolution_rate: f32,
    velocity_inheritance: f32,
}

impl TraitSet {
    /// Build a trait set, clamping every scalar into `[0, 1]`.
    #[must_use]
    pub fn new(
        flow_pattern: FlowPattern,
        sociability: f32,
        energy_efficiency: f32,
        color_evolution_rate: f32,
        velocity_inheritance: f32,
    ) -> Self {
        Self {
            flow_pattern,
            sociability: finite_clamped(sociability, 0.0, 1.0),
            energy_efficiency: finite_clamped(energy_efficiency, 0.0, 1.0),
            color_evolution_rate: finite_clamped(color_evolution_rate, 0.0, 1.0),
            velocity_inheritance: finite_clamped(velocity_inheritance, 0.0, 1.0),
        }
    }

    /// Sample a fully randomized trait set.
    pub fn sample(rng: &mut dyn RngCore) -> Self {
        let flow_pattern = match rng.random_range(0..4u8) {
            0 => FlowPattern::Swarm,
            1 => FlowPattern::Spiral,
            2 => FlowPattern::Wave,
            _ => FlowPattern::Attractor,
        };
        Self::new(
            flow_pattern,
            rng.random_range(0.0..1.0),
            rng.random_range(0.0..1.0),
            rng.random_range(0.0..1.0),
            rng.random_range(0.0..1.0),
        )
    }

    /// Fixed preset matching the simplified historical engine.
    #[must_use]
    pub fn legacy() -> Self {
        Self::new(FlowPattern::Wave, 0.5, 0.5, 0.3, 0.5)
    }

    /// Build a child trait set from this parent: the flow pattern is copied
    /// and every scalar receives a clamped uniform jitter in `±scale`.
    pub fn inherit(&self, rng: &mut dyn RngCore, scale: f32) -> Self {
        if scale <= 0.0 {
            return *self;
        }
        let mut jitter = |value: f32| clamp01(value + rng.random_range(-scale..scale));
        Self {
            flow_pattern: self.flow_pattern,
            sociability: jitter(self.sociability),
            energy_efficiency: jitter(self.energy_efficiency),
            color_evolution_rate: jitter(self.color_evolution_rate),
            velocity_inheritance: jitter(self.velocity_inheritance),
        }
    }

    #[must_use]
    pub const fn flow_pattern(&self) -> FlowPattern {
        self.flow_pattern
    }

    #[must_use]
    pub const fn sociability(&self) -> f32 {
        self.sociability
    }

    #[must_use]
    pub const fn energy_efficiency(&self) -> f32 {
        self.energy_efficiency
    }

    #[must_use]
    pub const fn color_evolution_rate(&self) -> f32 {
        self.color_evolution_rate
    }

    #[must_use]
    pub const fn velocity_inheritance(&self) -> f32 {
        self.velocity_inheritance
    }

    pub(crate) fn raise_sociability(&mut self, step: f32) {
        self.sociability = clamp01(self.sociability + step);
    }

    pub(crate) fn raise_energy_efficiency(&mut self, step: f32) {
        self.energy_efficiency = clamp01(self.energy_efficiency + step);
    }

    pub(crate) fn raise_color_evolution_rate(&mut self, step: f32) {
        self.color_evolution_rate = clamp01(self.color_evolution_rate + step);
    }

    /// Apply a clamped uniform jitter to one uniformly chosen scalar.
    pub(crate) fn jitter_scalar(&mut self, rng: &mut dyn RngCore, scale: f32) {
        if scale <= 0.0 {
            return;
        }
        let field = rng.random_range(0..4u8);
        let delta = rng.random_range(-scale..scale);
        match field {
            0 => self.sociability = clamp01(self.sociability + delta),
            1 => self.energy_efficiency = clamp01(self.energy_efficiency + delta),
            2 => self.color_evolution_rate = clamp01(self.color_evolution_rate + delta),
            _ => self.velocity_inheritance = clamp01(self.velocity_inheritance + delta),
        }
    }
}

impl Default for TraitSet {
    fn default() -> Self {
        Self::new(FlowPattern::default(), 0.5, 0.5, 0.5, 0.5)
    }
}

/// How initial trait sets are assigned at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraitSeeding {
    /// Every particle samples an independent random trait set.
    #[default]
    Random,
    /// Sample this many founder trait sets; each particle inherits (with
    /// mutation) from founder `index % count`.
    Founders(usize),
    /// Every particle starts from the fixed legacy preset.
    Legacy,
}

/// Collection of per-particle columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ParticleColumns {
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    colors: Vec<[f32; 3]>,
    base_hues: Vec<f32>,
    ages: Vec<f32>,
    generations: Vec<Generation>,
}

impl ParticleColumns {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
            base_hues: Vec::with_capacity(capacity),
            ages: Vec::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, position: Vec3, velocity: Vec3, base_hue: f32, color: [f32; 3]) {
        self.positions.push(position);
        self.velocities.push(velocity);
        self.colors.push(color);
        self.base_hues.push(base_hue);
        self.ages.push(0.0);
        self.generations.push(Generation::default());
    }

    /// Number of particles stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when no particles are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[must_use]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Vec3] {
        &self.velocities
    }

    #[must_use]
    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors
    }

    #[must_use]
    pub fn base_hues(&self) -> &[f32] {
        &self.base_hues
    }

    #[must_use]
    pub fn ages(&self) -> &[f32] {
        &self.ages
    }

    #[must_use]
    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }
}

/// Per-particle state beyond the dense columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleRuntime {
    pub traits: TraitSet,
    pub energy: f32,
    /// Cached band analysis for this particle.
    pub band: BandInfluence,
    /// Simulated seconds since the band cache was refreshed; infinity until
    /// the first refresh.
    band_elapsed: f32,
    evolution_timer: f32,
}

impl ParticleRuntime {
    fn new(traits: TraitSet) -> Self {
        Self {
            traits,
            energy: 100.0,
            band: BandInfluence::default(),
            band_elapsed: f32::INFINITY,
            evolution_timer: 0.0,
        }
    }
}

/// Combined snapshot of one particle's columns and runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleState {
    pub index: usize,
    pub position: Vec3,
    pub velocity: Vec3,
    pub color: [f32; 3],
    pub base_hue: f32,
    pub age: f32,
    pub generation: Generation,
    pub energy: f32,
    pub traits: TraitSet,
    pub band: BandInfluence,
}

/// Events emitted after processing one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvents {
    pub tick: Tick,
    /// Whether the neighbor index and cached neighbor sets were refreshed.
    pub index_rebuilt: bool,
    /// How many particles crossed the evolution threshold this tick.
    pub particles_evolved: usize,
    pub summary_recorded: bool,
}

/// Population statistics recorded on the summary interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub particle_count: usize,
    pub total_energy: f32,
    pub average_energy: f32,
    pub average_speed: f32,
    pub max_generation: Generation,
}

/// Errors that can occur when constructing a particle system.
#[derive(Debug, Error)]
pub enum ParticleSystemError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The neighbor index rejected its configuration.
    #[error("neighbor index error: {0}")]
    Index(#[from] IndexError),
}

/// Static configuration for a particle system. Fixed for the system's
/// lifetime; validated exhaustively at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotonLifeConfig {
    /// Number of particles; never changes after construction.
    pub population_size: usize,
    /// Half extent of the world cube along every axis.
    pub world_half_extent: f32,
    /// Cap on cached neighbors per particle.
    pub max_neighbors: usize,
    /// Ticks between neighbor index refreshes.
    pub neighbor_refresh_period: u32,
    /// Minimum simulated seconds between band-cache refreshes per particle.
    pub band_refresh_interval: f32,
    /// Step size for trait drift and mutation jitter.
    pub mutation_step: f32,
    /// Simulated seconds between evolution triggers per particle.
    pub evolution_period: f32,
    /// Base speed cap; scaled up with volume.
    pub max_speed_base: f32,
    /// How strongly volume widens the speed cap.
    pub max_speed_volume_gain: f32,
    /// Per-tick probability that a particle's color evolves.
    pub color_update_chance: f32,
    /// Probability of blending a neighbor's hue during a color update.
    pub color_diffusion_chance: f32,
    /// Radius within which close particles exchange energy.
    pub resonance_radius: f32,
    /// Fraction of the energy difference exchanged per tick; 0 disables.
    pub resonance_rate: f32,
    /// Cell edge length for the spatial index.
    pub index_cell_size: f32,
    /// Ticks between recorded summaries; 0 disables summaries.
    pub summary_interval: u32,
    /// Maximum number of retained summaries.
    pub history_capacity: usize,
    /// How initial trait sets are assigned.
    pub trait_seeding: TraitSeeding,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for PhotonLifeConfig {
    fn default() -> Self {
        Self {
            population_size: 2_000,
            world_half_extent: 10.0,
            max_neighbors: 15,
            neighbor_refresh_period: 5,
            band_refresh_interval: 0.033,
            mutation_step: 0.01,
            evolution_period: 5.0,
            max_speed_base: 0.1,
            max_speed_volume_gain: 1.0,
            color_update_chance: 0.1,
            color_diffusion_chance: 0.005,
            resonance_radius: 2.0,
            resonance_rate: 0.1,
            index_cell_size: 3.0,
            summary_interval: 60,
            history_capacity: 256,
            trait_seeding: TraitSeeding::default(),
            rng_seed: None,
        }
    }
}

impl PhotonLifeConfig {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), ParticleSystemError> {
        use ParticleSystemError::InvalidConfig;

        if self.population_size == 0 {
            return Err(InvalidConfig("population_size must be non-zero"));
        }
        if !self.world_half_extent.is_finite() || self.world_half_extent <= 0.0 {
            return Err(InvalidConfig("world_half_extent must be positive"));
        }
        if self.max_neighbors == 0 {
            return Err(InvalidConfig("max_neighbors must be non-zero"));
        }
        if self.neighbor_refresh_period == 0 {
            return Err(InvalidConfig("neighbor_refresh_period must be non-zero"));
        }
        if !self.band_refresh_interval.is_finite() || self.band_refresh_interval <= 0.0 {
            return Err(InvalidConfig("band_refresh_interval must be positive"));
        }
        if !self.mutation_step.is_finite() || !(0.0..=1.0).contains(&self.mutation_step) {
            return Err(InvalidConfig("mutation_step must lie in [0, 1]"));
        }
        if !self.evolution_period.is_finite() || self.evolution_period <= 0.0 {
            return Err(InvalidConfig("evolution_period must be positive"));
        }
        if !self.max_speed_base.is_finite() || self.max_speed_base <= 0.0 {
            return Err(InvalidConfig("max_speed_base must be positive"));
        }
        if !self.max_speed_volume_gain.is_finite() || self.max_speed_volume_gain < 0.0 {
            return Err(InvalidConfig("max_speed_volume_gain must be non-negative"));
        }
        if !self.color_update_chance.is_finite()
            || !(0.0..=1.0).contains(&self.color_update_chance)
        {
            return Err(InvalidConfig("color_update_chance must lie in [0, 1]"));
        }
        if !self.color_diffusion_chance.is_finite()
            || !(0.0..=1.0).contains(&self.color_diffusion_chance)
        {
            return Err(InvalidConfig("color_diffusion_chance must lie in [0, 1]"));
        }
        if !self.resonance_radius.is_finite() || self.resonance_radius < 0.0 {
            return Err(InvalidConfig("resonance_radius must be non-negative"));
        }
        if !self.resonance_rate.is_finite() || !(0.0..=1.0).contains(&self.resonance_rate) {
            return Err(InvalidConfig("resonance_rate must lie in [0, 1]"));
        }
        if !self.index_cell_size.is_finite() || self.index_cell_size <= 0.0 {
            return Err(InvalidConfig("index_cell_size must be positive"));
        }
        if self.summary_interval > 0 && self.history_capacity == 0 {
            return Err(InvalidConfig(
                "history_capacity must be non-zero when summaries are enabled",
            ));
        }
        if let TraitSeeding::Founders(count) = self.trait_seeding
            && count == 0
        {
            return Err(InvalidConfig("founder count must be non-zero"));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Band-scaled oscillating force. Mid and treble phases fold the particle's
/// position in, so identical audio still decorrelates spatially.
fn music_force(band: &BandInfluence, position: Vec3) -> Vec3 {
    let phase = band.rhythm_phase;

    let bass = Vec3::new(phase.sin(), phase.cos(), (phase * 0.5).sin()) * (band.bass * MUSIC_BASS_GAIN);

    let mid = Vec3::new(
        (phase + position.x * MID_POSITION_COUPLING).sin(),
        (phase + position.y * MID_POSITION_COUPLING).cos(),
        (phase + position.z * MID_POSITION_COUPLING).sin(),
    ) * (band.mid * MUSIC_MID_GAIN);

    let treble = Vec3::new(
        (phase * TREBLE_PHASE_RATE + position.x * MID_POSITION_COUPLING).sin(),
        (phase * TREBLE_PHASE_RATE + position.y * MID_POSITION_COUPLING).cos(),
        (phase * TREBLE_PHASE_RATE + position.z * MID_POSITION_COUPLING).sin(),
    ) * (band.treble * MUSIC_TREBLE_GAIN);

    bass + mid + treble
}

/// Separation, alignment, and cohesion over the cached neighbor set.
fn social_force(
    idx: usize,
    neighbors: &[usize],
    positions: &[Vec3],
    velocities: &[Vec3],
    traits: &TraitSet,
) -> Vec3 {
    let mut force = Vec3::ZERO;
    let own_position = positions[idx];
    let own_velocity = velocities[idx];

    for &other in neighbors {
        let offset = positions[other] - own_position;
        let distance = offset.length();
        if distance <= DISTANCE_EPSILON {
            continue;
        }
        if distance < SEPARATION_RADIUS {
            let push = (SEPARATION_RADIUS - distance) * SEPARATION_GAIN / distance;
            force += offset * -push;
        }
        if distance < ALIGNMENT_RADIUS {
            force += (velocities[other] - own_velocity)
                * (traits.velocity_inheritance() * ALIGNMENT_GAIN);
        }
        if distance < COHESION_RADIUS {
            force += offset * (traits.sociability() * COHESION_GAIN);
        }
    }
    force
}

/// Position of one of the three orbiting attractor points.
fn attractor_point(slot: usize, age: f32, half_extent: f32) -> Vec3 {
    const RATES: [f32; 3] = [0.23, 0.31, 0.17];
    let rate = RATES[slot.min(2)];
    let offset = TAU / 3.0 * slot as f32;
    let reach = half_extent * ATTRACTOR_REACH;
    Vec3::new(
        (age * rate + offset).cos() * reach,
        (age * rate * 0.8 + offset).sin() * reach,
        (age * rate * 1.3 + offset).cos() * reach * 0.5,
    )
}

/// Force contributed by the particle's flow pattern.
fn flow_force(
    traits: &TraitSet,
    band: &BandInfluence,
    position: Vec3,
    age: f32,
    generation: Generation,
    half_extent: f32,
) -> Vec3 {
    match traits.flow_pattern() {
        FlowPattern::Spiral => {
            let angle = age * (1.0 + 2.0 * band.treble);
            let radius = (band.bass + 0.5 * band.mid) * SPIRAL_GAIN;
            Vec3::new(
                angle.cos() * radius,
                angle.sin() * radius,
                (age * 0.5).sin() * band.bass * SPIRAL_LIFT_GAIN,
            )
        }
        FlowPattern::Wave => {
            let spatial = 1.0 + 2.0 * band.mid;
            let speed = 1.0 + 2.0 * band.bass;
            Vec3::new(
                (position.x * spatial - age * speed).sin() * (0.6 * band.bass + 0.4 * band.mid),
                (position.y * spatial - age * speed * 1.1).cos()
                    * (0.6 * band.mid + 0.4 * band.treble),
                (position.z * spatial - age * speed * 0.9).sin()
                    * (0.6 * band.treble + 0.4 * band.bass),
            ) * WAVE_GAIN
        }
        FlowPattern::Attractor => {
            let target = attractor_point(attractor_slot(band.rhythm_phase), age, half_extent);
            let offset = target - position;
            let distance = offset.length();
            offset * (ATTRACTOR_GAIN / (distance + 1.0))
        }
        FlowPattern::Swarm => {
            let offset = generation.0 as f32 * SWARM_GENERATION_PHASE;
            let phase = band.rhythm_phase;
            Vec3::new(
                (phase + offset).sin(),
                (phase * 1.3 + offset).cos(),
                (phase * 0.8 + offset).sin(),
            ) * SWARM_GAIN
        }
    }
}

/// Clamp one axis to the world box, reflecting and damping velocity on contact.
fn reflect_axis(position: &mut f32, velocity: &mut f32, half_extent: f32) {
    if *position > half_extent {
        *position = half_extent;
        *velocity = -*velocity * BOUNCE_DAMPING;
    } else if *position < -half_extent {
        *position = -half_extent;
        *velocity = -*velocity * BOUNCE_DAMPING;
    }
}

/// Owns the particle population and orchestrates the per-tick update order.
///
/// The host supplies one [`AudioFeatures`] sample per tick and reads the
/// position/color buffers back between ticks; the buffers' `3 × N` layout is
/// index-stable for the population's lifetime.
pub struct ParticleSystem {
    config: PhotonLifeConfig,
    tick: Tick,
    rng: SmallRng,
    columns: ParticleColumns,
    runtime: Vec<ParticleRuntime>,
    index: UniformGridIndex,
    neighbor_cache: Vec<Vec<usize>>,
    position_buffer: Vec<f32>,
    color_buffer: Vec<f32>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for ParticleSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleSystem")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("particle_count", &self.columns.len())
            .finish()
    }
}

impl ParticleSystem {
    /// Instantiate a system from the supplied configuration, spawning the
    /// full population with randomized positions and seeded traits.
    pub fn new(config: PhotonLifeConfig) -> Result<Self, ParticleSystemError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let count = config.population_size;
        let half = config.world_half_extent;

        let founders: Vec<TraitSet> = match config.trait_seeding {
            TraitSeeding::Founders(founder_count) => (0..founder_count)
                .map(|_| TraitSet::sample(&mut rng))
                .collect(),
            _ => Vec::new(),
        };

        let mut columns = ParticleColumns::with_capacity(count);
        let mut runtime = Vec::with_capacity(count);
        for idx in 0..count {
            let position = Vec3::new(
                rng.random_range(-half..half),
                rng.random_range(-half..half),
                rng.random_range(-half..half),
            );
            let velocity = Vec3::new(
                rng.random_range(-0.01..0.01),
                rng.random_range(-0.01..0.01),
                rng.random_range(-0.01..0.01),
            );
            let base_hue = rng.random_range(0.0..360.0);
            let traits = match config.trait_seeding {
                TraitSeeding::Random => TraitSet::sample(&mut rng),
                TraitSeeding::Founders(_) => {
                    founders[idx % founders.len()].inherit(&mut rng, config.mutation_step)
                }
                TraitSeeding::Legacy => TraitSet::legacy(),
            };
            columns.push(position, velocity, base_hue, hsl_to_rgb(base_hue, 0.5, 0.35));
            runtime.push(ParticleRuntime::new(traits));
        }

        let index = UniformGridIndex::new(config.index_cell_size, half);
        let mut system = Self {
            neighbor_cache: vec![Vec::new(); count],
            position_buffer: vec![0.0; count * 3],
            color_buffer: vec![0.0; count * 3],
            history: VecDeque::with_capacity(config.history_capacity),
            config,
            tick: Tick::zero(),
            rng,
            columns,
            runtime,
            index,
        };
        system.refresh_neighbor_cache()?;
        system.sync_buffers();
        Ok(system)
    }

    /// Execute one simulation tick.
    ///
    /// `delta_time` is simulated seconds since the previous tick; negative or
    /// non-finite values are treated as zero. Malformed audio degrades into
    /// the fallback band estimator rather than failing.
    pub fn tick(&mut self, sample: &AudioFeatures, delta_time: f32) -> TickEvents {
        let delta_time = if delta_time.is_finite() {
            delta_time.max(0.0)
        } else {
            0.0
        };
        let next_tick = self.tick.next();

        if sample.bands.len() < BAND_COUNT {
            debug!(
                bins = sample.bands.len(),
                "short band data; using pitch-gated volume estimator"
            );
        }

        let index_rebuilt = self.stage_neighbors(next_tick);
        self.stage_age(delta_time);
        self.stage_band_refresh(sample, delta_time);
        self.stage_trait_drift(sample);
        self.stage_forces(sample, delta_time);
        self.stage_color();
        self.stage_energy(sample);
        let particles_evolved = self.stage_evolution(delta_time);
        self.stage_resonance();
        let summary_recorded = self.stage_summary(next_tick);
        self.sync_buffers();

        self.tick = next_tick;
        TickEvents {
            tick: self.tick,
            index_rebuilt,
            particles_evolved,
            summary_recorded,
        }
    }

    fn stage_neighbors(&mut self, next_tick: Tick) -> bool {
        if !next_tick
            .0
            .is_multiple_of(u64::from(self.config.neighbor_refresh_period))
        {
            return false;
        }
        self.refresh_neighbor_cache().is_ok()
    }

    /// Rebuild the spatial index and recompute every particle's capped
    /// neighbor list. Candidates are gathered in deterministic grid order,
    /// then sorted by (distance, index) so the cap keeps the nearest ones.
    fn refresh_neighbor_cache(&mut self) -> Result<(), IndexError> {
        let positions: Vec<[f32; 3]> = self
            .columns
            .positions()
            .iter()
            .map(|p| [p.x, p.y, p.z])
            .collect();
        self.index.rebuild(&positions)?;
        trace!(tick = self.tick.0, "neighbor index rebuilt");

        let cap = self.config.max_neighbors;
        let index = &self.index;
        self.neighbor_cache
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, cache)| {
                let mut candidates: Vec<(OrderedFloat<f32>, usize)> = Vec::new();
                index.neighbors_within(
                    idx,
                    NEIGHBOR_RADIUS * NEIGHBOR_RADIUS,
                    &mut |other, dist_sq| {
                        candidates.push((dist_sq, other));
                    },
                );
                candidates.sort_unstable();
                candidates.truncate(cap);
                cache.clear();
                cache.extend(candidates.into_iter().map(|(_, other)| other));
            });
        Ok(())
    }

    fn stage_age(&mut self, delta_time: f32) {
        for age in &mut self.columns.ages {
            *age += delta_time;
        }
    }

    /// Refresh each particle's band cache when its refresh interval has
    /// elapsed, blending toward the fresh analysis. The first refresh assigns
    /// directly instead of smoothing from the zeroed cache.
    fn stage_band_refresh(&mut self, sample: &AudioFeatures, delta_time: f32) {
        let interval = self.config.band_refresh_interval;
        let ages = self.columns.ages();
        self.runtime
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, runtime)| {
                runtime.band_elapsed += delta_time;
                if runtime.band_elapsed < interval {
                    return;
                }
                let fresh = BandInfluence::analyze(sample, ages[idx]);
                if runtime.band_elapsed.is_finite() {
                    runtime.band.bass += (fresh.bass - runtime.band.bass) * BAND_SMOOTHING;
                    runtime.band.mid += (fresh.mid - runtime.band.mid) * BAND_SMOOTHING;
                    runtime.band.treble += (fresh.treble - runtime.band.treble) * BAND_SMOOTHING;
                } else {
                    runtime.band = fresh;
                }
                runtime.band.rhythm_phase = fresh.rhythm_phase;
                runtime.band_elapsed = 0.0;
            });
    }

    /// Sustained musical intensity slowly pushes traits: loud, fast passages
    /// favor sociability and color turnover; quiet ones favor efficiency.
    fn stage_trait_drift(&mut self, sample: &AudioFeatures) {
        let intensity = (sample.clamped_volume() + sample.clamped_tempo() / 2.0) / 100.0;
        let step = self.config.mutation_step;
        if intensity > INTENSITY_HIGH {
            for runtime in &mut self.runtime {
                runtime.traits.raise_sociability(step);
                runtime.traits.raise_color_evolution_rate(step);
            }
        } else if intensity < INTENSITY_LOW {
            for runtime in &mut self.runtime {
                runtime.traits.raise_energy_efficiency(step);
            }
        }
    }

    /// Compose music, social, and flow forces per particle, integrate, and
    /// bounce off the world box. Runs in parallel over immutable snapshots;
    /// results are written back in index order, so output is deterministic.
    fn stage_forces(&mut self, sample: &AudioFeatures, delta_time: f32) {
        let positions: Vec<Vec3> = self.columns.positions().to_vec();
        let velocities: Vec<Vec3> = self.columns.velocities().to_vec();
        let ages: Vec<f32> = self.columns.ages().to_vec();
        let generations: Vec<Generation> = self.columns.generations().to_vec();
        let runtime = &self.runtime;
        let neighbor_cache = &self.neighbor_cache;
        let half = self.config.world_half_extent;
        let max_speed = self.config.max_speed_base
            * (1.0 + sample.clamped_volume() / 100.0 * self.config.max_speed_volume_gain);

        let results: Vec<(Vec3, Vec3)> = (0..self.columns.len())
            .into_par_iter()
            .map(|idx| {
                let particle = &runtime[idx];
                let position = positions[idx];

                let force = music_force(&particle.band, position)
                    + social_force(
                        idx,
                        &neighbor_cache[idx],
                        &positions,
                        &velocities,
                        &particle.traits,
                    )
                    + flow_force(
                        &particle.traits,
                        &particle.band,
                        position,
                        ages[idx],
                        generations[idx],
                        half,
                    );

                let mut velocity = velocities[idx] + force * delta_time;
                let speed = velocity.length();
                if speed > max_speed {
                    velocity = velocity * (max_speed / speed);
                }

                let mut position = position + velocity;
                reflect_axis(&mut position.x, &mut velocity.x, half);
                reflect_axis(&mut position.y, &mut velocity.y, half);
                reflect_axis(&mut position.z, &mut velocity.z, half);

                (position, velocity)
            })
            .collect();

        for (idx, (position, velocity)) in results.into_iter().enumerate() {
            self.columns.positions[idx] = position;
            self.columns.velocities[idx] = velocity;
        }
    }

    /// Probabilistic color evolution: drift hue toward the dominant band's
    /// anchor, rarely blend in a neighbor's hue, then recompute RGB.
    fn stage_color(&mut self) {
        let chance = self.config.color_update_chance;
        let diffusion_chance = self.config.color_diffusion_chance;
        let hues_before: Vec<f32> = self.columns.base_hues().to_vec();

        for idx in 0..self.columns.len() {
            if self.rng.random::<f32>() >= chance {
                continue;
            }
            let band = self.runtime[idx].band;
            let rate = self.runtime[idx].traits.color_evolution_rate();

            let mut hue = self.columns.base_hues[idx];
            let target = band.dominant_hue();
            hue = wrap_hue(hue + shortest_hue_arc(hue, target) * rate * HUE_DRIFT_GAIN);

            let neighbors = &self.neighbor_cache[idx];
            if !neighbors.is_empty() && self.rng.random::<f32>() < diffusion_chance {
                let pick = neighbors[self.rng.random_range(0..neighbors.len())];
                hue = wrap_hue(hue + shortest_hue_arc(hue, hues_before[pick]) * HUE_DIFFUSION_BLEND);
            }

            let drive = band.drive();
            let saturation = clamp01(0.5 + 0.5 * drive);
            let lightness = clamp01(0.35 + 0.25 * drive);
            self.columns.base_hues[idx] = hue;
            self.columns.colors[idx] = hsl_to_rgb(hue, saturation, lightness);
        }
    }

    fn stage_energy(&mut self, sample: &AudioFeatures) {
        let volume = sample.clamped_volume() / 100.0;
        for runtime in &mut self.runtime {
            let gain = volume * runtime.traits.energy_efficiency() * ENERGY_GAIN;
            runtime.energy = (runtime.energy + gain - ENERGY_DECAY).clamp(ENERGY_MIN, ENERGY_MAX);
        }
    }

    /// Periodic per-particle evolution: apply energy-driven trait pressure,
    /// jitter one scalar trait, and advance the generation counter.
    fn stage_evolution(&mut self, delta_time: f32) -> usize {
        let period = self.config.evolution_period;
        let step = self.config.mutation_step;
        let mut evolved = 0usize;

        for idx in 0..self.runtime.len() {
            let runtime = &mut self.runtime[idx];
            runtime.evolution_timer += delta_time;
            if runtime.evolution_timer <= period {
                continue;
            }
            if runtime.energy > EVOLUTION_ENERGY_HIGH {
                runtime.traits.raise_sociability(step);
            }
            if runtime.energy < EVOLUTION_ENERGY_LOW {
                runtime.traits.raise_energy_efficiency(step);
            }
            runtime.traits.jitter_scalar(&mut self.rng, step);
            runtime.evolution_timer = 0.0;
            self.columns.generations[idx] = self.columns.generations[idx].next();
            evolved += 1;
        }

        if evolved > 0 {
            debug!(evolved, tick = self.tick.0, "evolution threshold crossed");
        }
        evolved
    }

    /// Close particles exchange a fraction of their energy difference, each
    /// pair once per tick, both sides clamped.
    fn stage_resonance(&mut self) {
        let rate = self.config.resonance_rate;
        if rate <= 0.0 {
            return;
        }
        let radius_sq = self.config.resonance_radius * self.config.resonance_radius;

        for idx in 0..self.columns.len() {
            for &other in &self.neighbor_cache[idx] {
                if other <= idx {
                    continue;
                }
                let offset = self.columns.positions[other] - self.columns.positions[idx];
                if offset.length_squared() > radius_sq {
                    continue;
                }
                let energy_a = self.runtime[idx].energy;
                let energy_b = self.runtime[other].energy;
                let transfer = (energy_a - energy_b) * rate;
                if transfer.abs() <= f32::EPSILON {
                    continue;
                }
                self.runtime[idx].energy = (energy_a - transfer).clamp(ENERGY_MIN, ENERGY_MAX);
                self.runtime[other].energy = (energy_b + transfer).clamp(ENERGY_MIN, ENERGY_MAX);
            }
        }
    }

    fn stage_summary(&mut self, next_tick: Tick) -> bool {
        let interval = self.config.summary_interval;
        if interval == 0 || !next_tick.0.is_multiple_of(u64::from(interval)) {
            return false;
        }

        let particle_count = self.columns.len();
        let total_energy: f32 = self.runtime.iter().map(|runtime| runtime.energy).sum();
        let total_speed: f32 = self
            .columns
            .velocities()
            .iter()
            .map(|velocity| velocity.length())
            .sum();
        let max_generation = self
            .columns
            .generations()
            .iter()
            .copied()
            .max()
            .unwrap_or_default();

        let summary = TickSummary {
            tick: next_tick,
            particle_count,
            total_energy,
            average_energy: total_energy / particle_count as f32,
            average_speed: total_speed / particle_count as f32,
            max_generation,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        true
    }

    /// Mirror particle state into the flat render buffers.
    fn sync_buffers(&mut self) {
        for (idx, position) in self.columns.positions().iter().enumerate() {
            let base = idx * 3;
            self.position_buffer[base] = position.x;
            self.position_buffer[base + 1] = position.y;
            self.position_buffer[base + 2] = position.z;
        }
        for (idx, color) in self.columns.colors().iter().enumerate() {
            let base = idx * 3;
            self.color_buffer[base..base + 3].copy_from_slice(color);
        }
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &PhotonLifeConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick_count(&self) -> Tick {
        self.tick
    }

    /// Number of particles; constant for the system's lifetime.
    #[must_use]
    pub fn particle_count(&self) -> usize {
        self.columns.len()
    }

    /// Flat `3 × N` position buffer, refreshed once per tick.
    #[must_use]
    pub fn positions(&self) -> &[f32] {
        &self.position_buffer
    }

    /// Flat `3 × N` color buffer, refreshed once per tick.
    #[must_use]
    pub fn colors(&self) -> &[f32] {
        &self.color_buffer
    }

    /// Read-only access to the dense particle columns.
    #[must_use]
    pub fn columns(&self) -> &ParticleColumns {
        &self.columns
    }

    /// Combined snapshot of one particle.
    #[must_use]
    pub fn snapshot(&self, idx: usize) -> Option<ParticleState> {
        if idx >= self.columns.len() {
            return None;
        }
        let runtime = &self.runtime[idx];
        Some(ParticleState {
            index: idx,
            position: self.columns.positions[idx],
            velocity: self.columns.velocities[idx],
            color: self.columns.colors[idx],
            base_hue: self.columns.base_hues[idx],
            age: self.columns.ages[idx],
            generation: self.columns.generations[idx],
            energy: runtime.energy,
            traits: runtime.traits,
            band: runtime.band,
        })
    }

    /// Cached neighbor indices for one particle, possibly a few ticks stale.
    #[must_use]
    pub fn cached_neighbors(&self, idx: usize) -> Option<&[usize]> {
        self.neighbor_cache.get(idx).map(Vec::as_slice)
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Borrow the system RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bands(level: f32) -> Vec<f32> {
        vec![level; BAND_COUNT]
    }

    fn loud_sample() -> AudioFeatures {
        AudioFeatures {
            volume: 100.0,
            tempo: 240.0,
            pitch: 440.0,
            bands: full_bands(1.0),
        }
    }

    fn small_config(seed: u64) -> PhotonLifeConfig {
        PhotonLifeConfig {
            population_size: 16,
            rng_seed: Some(seed),
            summary_interval: 0,
            ..PhotonLifeConfig::default()
        }
    }

    #[test]
    fn trait_scalars_are_clamped_by_construction() {
        let traits = TraitSet::new(FlowPattern::Spiral, 1.7, -0.3, f32::NAN, 0.4);
        assert_eq!(traits.sociability(), 1.0);
        assert_eq!(traits.energy_efficiency(), 0.0);
        assert_eq!(traits.color_evolution_rate(), 0.0);
        assert_eq!(traits.velocity_inheritance(), 0.4);

        let mut traits = TraitSet::new(FlowPattern::Swarm, 0.99, 0.5, 0.5, 0.5);
        traits.raise_sociability(0.05);
        assert_eq!(traits.sociability(), 1.0);
    }

    #[test]
    fn inherited_traits_stay_in_unit_interval() {
        let mut rng = SmallRng::seed_from_u64(11);
        let parent = TraitSet::new(FlowPattern::Attractor, 0.95, 0.02, 0.5, 0.99);
        for _ in 0..200 {
            let child = parent.inherit(&mut rng, 0.4);
            assert_eq!(child.flow_pattern(), FlowPattern::Attractor);
            for value in [
                child.sociability(),
                child.energy_efficiency(),
                child.color_evolution_rate(),
                child.velocity_inheritance(),
            ] {
                assert!((0.0..=1.0).contains(&value));
            }
        }
    }

    #[test]
    fn jitter_keeps_scalars_in_unit_interval() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut traits = TraitSet::default();
        for _ in 0..500 {
            traits.jitter_scalar(&mut rng, 0.9);
            for value in [
                traits.sociability(),
                traits.energy_efficiency(),
                traits.color_evolution_rate(),
                traits.velocity_inheritance(),
            ] {
                assert!((0.0..=1.0).contains(&value));
            }
        }
    }

    #[test]
    fn legacy_preset_uses_wave_pattern() {
        let traits = TraitSet::legacy();
        assert_eq!(traits.flow_pattern(), FlowPattern::Wave);
        assert_eq!(traits.sociability(), 0.5);
    }

    #[test]
    fn band_analysis_averages_bins() {
        let sample = AudioFeatures {
            volume: 50.0,
            tempo: 120.0,
            pitch: 440.0,
            bands: vec![0.2, 0.4, 0.9, 0.3, 0.6, 0.9, 0.5, 0.7],
        };
        let band = BandInfluence::analyze(&sample, 0.0);
        assert!((band.bass - 0.3).abs() < 1e-6);
        assert!((band.mid - 0.6).abs() < 1e-6);
        assert!((band.treble - 0.6).abs() < 1e-6);
    }

    #[test]
    fn band_fallback_weights_by_pitch_range() {
        let mut sample = AudioFeatures {
            volume: 80.0,
            tempo: 120.0,
            pitch: 100.0,
            bands: Vec::new(),
        };
        let low = BandInfluence::analyze(&sample, 0.0);
        assert!(low.bass > low.mid && low.mid > low.treble);

        sample.pitch = 500.0;
        let mid = BandInfluence::analyze(&sample, 0.0);
        assert!(mid.mid > mid.bass && mid.mid > mid.treble);

        sample.pitch = 2_000.0;
        let high = BandInfluence::analyze(&sample, 0.0);
        assert!(high.treble > high.bass && high.treble > high.mid);

        sample.volume = 0.0;
        let silent = BandInfluence::analyze(&sample, 0.0);
        assert_eq!(silent.bass, 0.0);
        assert_eq!(silent.mid, 0.0);
        assert_eq!(silent.treble, 0.0);
    }

    #[test]
    fn rhythm_phase_tracks_tempo_and_age() {
        let sample = AudioFeatures {
            volume: 10.0,
            tempo: 120.0,
            pitch: 440.0,
            bands: full_bands(0.1),
        };
        let band = BandInfluence::analyze(&sample, 1.0);
        assert!((band.rhythm_phase - 2.0).abs() < 1e-6);

        // A full cycle wraps back into [0, 2π).
        let wrapped = BandInfluence::analyze(&sample, TAU);
        assert!(wrapped.rhythm_phase < TAU);
    }

    #[test]
    fn attractor_slot_quantizes_phase_thirds() {
        let third = TAU / 3.0;
        assert_eq!(attractor_slot(0.1), 0);
        assert_eq!(attractor_slot(third + 0.1), 1);
        assert_eq!(attractor_slot(2.0 * third + 0.1), 2);
        assert_eq!(attractor_slot(TAU + 0.1), 0);
        assert_eq!(attractor_slot(-0.1), 2);
    }

    #[test]
    fn social_force_is_zero_without_neighbors() {
        let positions = vec![Vec3::new(1.0, 2.0, 3.0)];
        let velocities = vec![Vec3::new(0.1, 0.0, 0.0)];
        let traits = TraitSet::default();
        let force = social_force(0, &[], &positions, &velocities, &traits);
        assert_eq!(force, Vec3::ZERO);
    }

    #[test]
    fn separation_pushes_close_particles_apart() {
        let positions = vec![Vec3::ZERO, Vec3::new(0.5, 0.0, 0.0)];
        let velocities = vec![Vec3::ZERO, Vec3::ZERO];
        let traits = TraitSet::new(FlowPattern::Swarm, 0.0, 0.5, 0.5, 0.0);
        let force = social_force(0, &[1], &positions, &velocities, &traits);
        assert!(force.x < 0.0, "separation must push away from the neighbor");
        assert_eq!(force.y, 0.0);
    }

    #[test]
    fn coincident_neighbor_contributes_no_force() {
        let positions = vec![Vec3::ZERO, Vec3::ZERO];
        let velocities = vec![Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)];
        let traits = TraitSet::default();
        let force = social_force(0, &[1], &positions, &velocities, &traits);
        assert!(force.x.is_finite());
        assert_eq!(force, Vec3::ZERO);
    }

    #[test]
    fn boundary_reflection_flips_and_damps() {
        let mut position = 10.5;
        let mut velocity = 0.2;
        reflect_axis(&mut position, &mut velocity, 10.0);
        assert_eq!(position, 10.0);
        assert!((velocity + 0.16).abs() < 1e-6);

        let mut position = -10.2;
        let mut velocity = -0.1;
        reflect_axis(&mut position, &mut velocity, 10.0);
        assert_eq!(position, -10.0);
        assert!((velocity - 0.08).abs() < 1e-6);
    }

    #[test]
    fn hsl_conversion_hits_primaries() {
        let red = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((red[0] - 1.0).abs() < 1e-6 && red[1] < 1e-6 && red[2] < 1e-6);

        let green = hsl_to_rgb(120.0, 1.0, 0.5);
        assert!(green[1] > 0.99 && green[0] < 1e-6);

        let blue = hsl_to_rgb(240.0, 1.0, 0.5);
        assert!(blue[2] > 0.99 && blue[0] < 1e-6);
    }

    #[test]
    fn shortest_hue_arc_crosses_the_wrap() {
        assert!((shortest_hue_arc(350.0, 10.0) - 20.0).abs() < 1e-6);
        assert!((shortest_hue_arc(10.0, 350.0) + 20.0).abs() < 1e-6);
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let bad = [
            PhotonLifeConfig {
                population_size: 0,
                ..PhotonLifeConfig::default()
            },
            PhotonLifeConfig {
                world_half_extent: 0.0,
                ..PhotonLifeConfig::default()
            },
            PhotonLifeConfig {
                max_neighbors: 0,
                ..PhotonLifeConfig::default()
            },
            PhotonLifeConfig {
                color_update_chance: 1.5,
                ..PhotonLifeConfig::default()
            },
            PhotonLifeConfig {
                trait_seeding: TraitSeeding::Founders(0),
                ..PhotonLifeConfig::default()
            },
            PhotonLifeConfig {
                summary_interval: 10,
                history_capacity: 0,
                ..PhotonLifeConfig::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(
                    ParticleSystem::new(config),
                    Err(ParticleSystemError::InvalidConfig(_))
                ),
                "expected construction to fail"
            );
        }
    }

    #[test]
    fn resonance_moves_energies_together() {
        let mut system = ParticleSystem::new(small_config(5)).expect("system");
        // Put particles 0 and 1 next to each other and give them a large
        // energy imbalance.
        system.columns.positions[0] = Vec3::ZERO;
        system.columns.positions[1] = Vec3::new(0.5, 0.0, 0.0);
        system.refresh_neighbor_cache().expect("refresh");
        system.runtime[0].energy = 180.0;
        system.runtime[1].energy = 20.0;

        system.stage_resonance();
        let high = system.runtime[0].energy;
        let low = system.runtime[1].energy;
        assert!(high < 180.0, "donor loses energy");
        assert!(low > 20.0, "receiver gains energy");
        assert!((ENERGY_MIN..=ENERGY_MAX).contains(&high));
        assert!((ENERGY_MIN..=ENERGY_MAX).contains(&low));
    }

    #[test]
    fn band_cache_waits_for_refresh_interval() {
        let mut system = ParticleSystem::new(small_config(9)).expect("system");
        let quiet = AudioFeatures {
            volume: 40.0,
            tempo: 120.0,
            pitch: 440.0,
            bands: full_bands(0.5),
        };

        // The first tick always analyzes and assigns directly.
        system.tick(&quiet, 0.016);
        let bass_after_first = system.runtime[0].band.bass;
        assert!((bass_after_first - 0.5).abs() < 1e-6);

        // The next tick is inside the refresh interval; the cache must not move.
        system.tick(&loud_sample(), 0.016);
        assert_eq!(system.runtime[0].band.bass, bass_after_first);

        // Crossing the interval refreshes again, smoothing toward the louder
        // analysis instead of jumping to it.
        system.tick(&loud_sample(), 0.02);
        let bass_after_third = system.runtime[0].band.bass;
        assert!(bass_after_third > bass_after_first);
        assert!(bass_after_third < 1.0);
    }

    #[test]
    fn evolution_advances_generations() {
        let config = PhotonLifeConfig {
            evolution_period: 0.05,
            ..small_config(13)
        };
        let mut system = ParticleSystem::new(config).expect("system");
        let sample = loud_sample();

        let mut evolved_total = 0;
        for _ in 0..10 {
            evolved_total += system.tick(&sample, 0.016).particles_evolved;
        }
        assert!(evolved_total > 0);
        let max_generation = system
            .columns
            .generations()
            .iter()
            .map(|generation| generation.0)
            .max()
            .unwrap();
        assert!(max_generation >= 1);
    }

    #[test]
    fn trait_drift_responds_to_intensity() {
        let mut system = ParticleSystem::new(small_config(21)).expect("system");

        // Loud, fast music raises sociability by exactly one step.
        let before = system.runtime[0].traits.sociability();
        system.stage_trait_drift(&loud_sample());
        let after = system.runtime[0].traits.sociability();
        assert!((after - clamp01(before + 0.01)).abs() < 1e-6);

        // Quiet, slow music raises energy efficiency instead.
        let quiet = AudioFeatures {
            volume: 0.0,
            tempo: 40.0,
            pitch: 440.0,
            bands: Vec::new(),
        };
        let efficiency_before = system.runtime[0].traits.energy_efficiency();
        system.stage_trait_drift(&quiet);
        let efficiency_after = system.runtime[0].traits.energy_efficiency();
        assert!((efficiency_after - clamp01(efficiency_before + 0.01)).abs() < 1e-6);
    }
}
