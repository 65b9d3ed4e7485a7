use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rapier3d::na::{DMatrix, Quaternion, UnitQuaternion, Vector3, point, vector};
use rapier3d::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const GRAVITY_Y: f32 = -9.81;
const GROUND_COLLISION_GROUP: Group = Group::GROUP_1;
const ROBOT_COLLISION_GROUP: Group = Group::GROUP_2;
const GROUND_FRICTION: f32 = 1.08;
const GROUND_RESTITUTION: f32 = 0.015;
const LINK_LINEAR_DAMPING: f32 = 0.19;
const LINK_ANGULAR_DAMPING: f32 = 0.31;
const JOINT_MOTOR_RESPONSE: f32 = 12.0;
const MOTOR_STIFFNESS: f32 = 50.0;
const UNEVEN_TERRAIN_SEED: u64 = 42;
const UNEVEN_TERRAIN_CELLS: usize = 64;
const UNEVEN_TERRAIN_EXTENT: f32 = 32.0;
const UNEVEN_BUMP_HEIGHT: f32 = 0.08;
const STAIR_STEP_HEIGHT: f32 = 0.08;
const STAIR_STEP_DEPTH: f32 = 0.25;
const STAIR_STEP_WIDTH: f32 = 2.0;
const STAIR_STEP_COUNT: usize = 8;
const SLOPE_ANGLE_RAD: f32 = 15.0 * std::f32::consts::PI / 180.0;
const SLOPE_LENGTH: f32 = 3.0;
const SLOPE_WIDTH: f32 = 2.0;
const WEIGHT_STABILITY: f32 = 0.40;
const WEIGHT_UPRIGHTNESS: f32 = 0.35;
const WEIGHT_GROUNDING: f32 = 0.25;
const MAX_SCORED_DISPLACEMENT: f32 = 10.0;
const STABILITY_DECAY: f32 = 3.0;
const TILT_FALLEN_THRESHOLD: f32 = 0.1;
const FALL_THROUGH_HEIGHT: f32 = -0.5;
const SELF_OVERLAP_MARGIN: f32 = 1e-3;
const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_BIND_PORT: u16 = 8080;
const ENV_BIND_PORT: &str = "PORT";
const ENV_SIM_WORKER_LIMIT: &str = "ROBOFORGE_MAX_CONCURRENT_SIMS";
const ENV_CONFIG_PATH: &str = "ROBOFORGE_CONFIG";
const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
const ENV_OPENAI_MODEL: &str = "OPENAI_MODEL";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const LIMB_HINT_BODY_RADIUS: f32 = 0.3;

const SYSTEM_PROMPT: &str = r#"You design small rigid-body robots. Respond with ONLY a JSON object
describing the robot, no prose, no markdown fences.

Format (Y is up, distances in meters, masses in kg):
{
  "name": "rover",
  "links": [
    {"name": "body", "mass": 8.0,
     "visual": {"shape": "box", "size": [0.6, 0.25, 0.4]},
     "collision": {"shape": "box", "size": [0.6, 0.25, 0.4]}},
    {"name": "wheel_fl", "mass": 1.2,
     "visual": {"shape": "sphere", "radius": 0.12},
     "collision": {"shape": "sphere", "radius": 0.12}}
  ],
  "joints": [
    {"name": "axle_fl", "jointType": "continuous", "parent": 0, "child": 1,
     "origin": [0.45, -0.25, 0.35], "axis": [0, 0, 1],
     "limit": {"lower": 0.0, "upper": 0.0, "effort": 150.0, "velocity": 6.0}}
  ]
}

Rules:
- links[0] is the root body; joints reference links by index and every joint's
  parent index must be lower than its child index.
- every link needs both "visual" and "collision" geometry ("box" with size,
  "cylinder" with radius+length, or "sphere" with radius).
- every non-fixed joint origin must place the child clearly outside the parent
  (offset larger than the parent's bounding radius) or the parts will
  interpenetrate at spawn.
- jointType is one of "fixed", "revolute", "continuous", "prismatic";
  revolute/prismatic joints need an effort limit of at least 100.
"#;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const fn default_step_rate_hz() -> f32 {
    240.0
}
const fn default_record_hz() -> f32 {
    30.0
}
const fn default_horizon_seconds() -> f32 {
    5.0
}
const fn default_sanity_horizon_seconds() -> f32 {
    1.5
}
const fn default_divergence_distance() -> f32 {
    50.0
}
const fn default_sanity_divergence_distance() -> f32 {
    10.0
}
const fn default_min_link_clearance() -> f32 {
    0.05
}
const fn default_min_joint_effort() -> f32 {
    100.0
}
const fn default_max_attempts() -> usize {
    5
}
const fn default_max_backend_failures() -> usize {
    3
}
const fn default_producer_timeout_seconds() -> u64 {
    60
}
const fn default_sim_wall_clock_timeout_seconds() -> u64 {
    30
}
const fn default_motor_amplitude() -> f32 {
    0.5
}
const fn default_motor_frequency_hz() -> f32 {
    1.0
}

/// Tunables for the generate -> validate -> simulate -> repair pipeline.
///
/// The divergence and effort thresholds were tuned empirically; only their
/// order of magnitude is load-bearing, so everything is overridable through a
/// JSON config file instead of being baked in.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineConfig {
    /// Physics step rate in Hz.
    #[serde(default = "default_step_rate_hz")]
    step_rate_hz: f32,
    /// Trajectory recording rate in Hz. Must be lower than the step rate;
    /// recording decimates physics steps rather than integrating separately.
    #[serde(default = "default_record_hz")]
    record_hz: f32,
    /// Horizon for scoring/stress simulations, in seconds.
    #[serde(default = "default_horizon_seconds")]
    horizon_seconds: f32,
    /// Shorter horizon used by the repair loop's spawn-and-settle check.
    #[serde(default = "default_sanity_horizon_seconds")]
    sanity_horizon_seconds: f32,
    /// Base displacement from spawn beyond which a run counts as diverged.
    #[serde(default = "default_divergence_distance")]
    divergence_distance: f32,
    /// Tighter divergence threshold for the sanity check.
    #[serde(default = "default_sanity_divergence_distance")]
    sanity_divergence_distance: f32,
    /// Absolute floor for the parent/child clearance check, in meters.
    #[serde(default = "default_min_link_clearance")]
    min_link_clearance: f32,
    /// Minimum effort limit for revolute/prismatic joints.
    #[serde(default = "default_min_joint_effort")]
    min_joint_effort: f32,
    /// Repair loop attempt budget.
    #[serde(default = "default_max_attempts")]
    max_attempts: usize,
    /// Consecutive producer/physics infrastructure failures before the
    /// session is abandoned instead of retried.
    #[serde(default = "default_max_backend_failures")]
    max_backend_failures: usize,
    /// Timeout applied to each descriptor producer call.
    #[serde(default = "default_producer_timeout_seconds")]
    producer_timeout_seconds: u64,
    /// Wall-clock guard on a single simulation; a hang is treated as
    /// divergence.
    #[serde(default = "default_sim_wall_clock_timeout_seconds")]
    sim_wall_clock_timeout_seconds: u64,
    /// Amplitude of the periodic per-joint position targets, in radians.
    #[serde(default = "default_motor_amplitude")]
    motor_amplitude: f32,
    /// Frequency of the actuation signal in Hz.
    #[serde(default = "default_motor_frequency_hz")]
    motor_frequency_hz: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!("empty config always parses"))
    }
}

impl PipelineConfig {
    fn load() -> Self {
        let Ok(path) = std::env::var(ENV_CONFIG_PATH) else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => {
                    info!("loaded pipeline config from {path}");
                    config
                }
                Err(err) => {
                    warn!("config file {path} is invalid ({err}); using defaults");
                    Self::default()
                }
            },
            Err(err) => {
                warn!("could not read config file {path} ({err}); using defaults");
                Self::default()
            }
        }
    }

    fn dt(&self) -> f32 {
        1.0 / self.step_rate_hz
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
enum SimError {
    /// Malformed geometry reached the physics layer despite validation.
    #[error("physics backend rejected the description: {0}")]
    BackendLoad(String),
    #[error("simulation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
enum ProducerError {
    #[error("producer request failed: {0}")]
    Request(String),
    #[error("producer request timed out")]
    Timeout,
    #[error("producer returned no usable robot description")]
    Empty,
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("{count} consecutive infrastructure failures, giving up: {last}")]
    BackendFailure { count: usize, last: String },
    #[error("session cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Robot description
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "shape")]
enum Geometry {
    Box { size: [f32; 3] },
    Cylinder { radius: f32, length: f32 },
    Sphere { radius: f32 },
}

impl Geometry {
    /// Half-extent of the geometry's widest axis, used as the clearance
    /// radius for the spatial separation check.
    fn bounding_radius(&self) -> f32 {
        match self {
            Geometry::Box { size } => size[0].max(size[1]).max(size[2]) * 0.5,
            Geometry::Cylinder { radius, length } => radius.max(length * 0.5),
            Geometry::Sphere { radius } => *radius,
        }
    }

    fn half_extents(&self) -> Vector3<f32> {
        match self {
            Geometry::Box { size } => vector![size[0] * 0.5, size[1] * 0.5, size[2] * 0.5],
            Geometry::Cylinder { radius, length } => vector![*radius, length * 0.5, *radius],
            Geometry::Sphere { radius } => vector![*radius, *radius, *radius],
        }
    }

    fn is_plausible(&self) -> bool {
        let finite_positive = |v: f32| v.is_finite() && v > 0.0;
        match self {
            Geometry::Box { size } => size.iter().copied().all(finite_positive),
            Geometry::Cylinder { radius, length } => {
                finite_positive(*radius) && finite_positive(*length)
            }
            Geometry::Sphere { radius } => finite_positive(*radius),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum JointType {
    Fixed,
    Revolute,
    Continuous,
    Prismatic,
}

impl JointType {
    fn is_actuated(self) -> bool {
        matches!(
            self,
            JointType::Revolute | JointType::Continuous | JointType::Prismatic
        )
    }
}

const fn default_limit_lower() -> f32 {
    -1.57
}
const fn default_limit_upper() -> f32 {
    1.57
}
const fn default_limit_effort() -> f32 {
    150.0
}
const fn default_limit_velocity() -> f32 {
    2.0
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct JointLimit {
    #[serde(default = "default_limit_lower")]
    lower: f32,
    #[serde(default = "default_limit_upper")]
    upper: f32,
    #[serde(default = "default_limit_effort")]
    effort: f32,
    #[serde(default = "default_limit_velocity")]
    velocity: f32,
}

impl Default for JointLimit {
    fn default() -> Self {
        Self {
            lower: default_limit_lower(),
            upper: default_limit_upper(),
            effort: default_limit_effort(),
            velocity: default_limit_velocity(),
        }
    }
}

const fn default_joint_axis() -> [f32; 3] {
    [1.0, 0.0, 0.0]
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Link {
    name: String,
    mass: f32,
    #[serde(default)]
    visual: Option<Geometry>,
    #[serde(default)]
    collision: Option<Geometry>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Joint {
    name: String,
    joint_type: JointType,
    /// Link indices into the description's link arena. Parent must be a
    /// lower index than child, which makes cycle-freedom an index check.
    parent: usize,
    child: usize,
    /// Child offset from the parent link's center, in the parent frame.
    origin: [f32; 3],
    #[serde(default = "default_joint_axis")]
    axis: [f32; 3],
    #[serde(default)]
    limit: JointLimit,
}

/// A robot as a flat arena of links plus index-based joints. Descriptions are
/// never mutated in place; a repair attempt always produces a fresh one.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct RobotDescription {
    name: String,
    links: Vec<Link>,
    #[serde(default)]
    joints: Vec<Joint>,
}

impl RobotDescription {
    /// Pairs of link indices connected by a joint, normalized low-high.
    fn adjacent_pairs(&self) -> HashSet<(usize, usize)> {
        self.joints
            .iter()
            .map(|joint| (joint.parent.min(joint.child), joint.parent.max(joint.child)))
            .collect()
    }

    /// Designated ground-contact links: the leaves of the link tree (feet,
    /// wheels). A robot with no joints grounds on its root.
    fn contact_link_indices(&self) -> Vec<usize> {
        let parents: HashSet<usize> = self.joints.iter().map(|joint| joint.parent).collect();
        let leaves: Vec<usize> = (0..self.links.len())
            .filter(|index| !parents.contains(index))
            .collect();
        if leaves.is_empty() { vec![0] } else { leaves }
    }

    fn link_name(&self, index: usize) -> &str {
        self.links
            .get(index)
            .map(|link| link.name.as_str())
            .unwrap_or("<unknown>")
    }
}

fn parse_description(raw: &str) -> Result<RobotDescription, String> {
    let description: RobotDescription =
        serde_json::from_str(raw).map_err(|err| format!("not a valid robot JSON object: {err}"))?;
    if description.links.is_empty() {
        return Err("description has no links".to_string());
    }
    Ok(description)
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum IssueCode {
    ParseError,
    InvalidGraph,
    MissingVisual,
    MissingCollision,
    InsufficientClearance,
    LowEffort,
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IssueCode::ParseError => "PARSE_ERROR",
            IssueCode::InvalidGraph => "INVALID_GRAPH",
            IssueCode::MissingVisual => "MISSING_VISUAL",
            IssueCode::MissingCollision => "MISSING_COLLISION",
            IssueCode::InsufficientClearance => "INSUFFICIENT_CLEARANCE",
            IssueCode::LowEffort => "LOW_EFFORT",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ValidationIssue {
    code: IssueCode,
    message: String,
    /// Offending link or joint name, when one can be singled out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationResult {
    passed: bool,
    issues: Vec<ValidationIssue>,
    #[serde(skip)]
    description: Option<RobotDescription>,
}

impl ValidationResult {
    fn has_issue(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|issue| issue.code == code)
    }
}

/// Static checks on a candidate description. All issues are collected in one
/// pass so a single round of feedback can address several problems; only a
/// parse failure short-circuits, since nothing else can be inspected.
fn validate_description(raw: &str, config: &PipelineConfig) -> ValidationResult {
    let description = match parse_description(raw) {
        Ok(description) => description,
        Err(message) => {
            return ValidationResult {
                passed: false,
                issues: vec![ValidationIssue {
                    code: IssueCode::ParseError,
                    message,
                    subject: None,
                }],
                description: None,
            };
        }
    };

    let mut issues = Vec::new();
    check_graph(&description, &mut issues);
    check_completeness(&description, &mut issues);
    check_clearance(&description, config, &mut issues);
    check_effort(&description, config, &mut issues);

    ValidationResult {
        passed: issues.is_empty(),
        issues,
        description: Some(description),
    }
}

fn check_graph(description: &RobotDescription, issues: &mut Vec<ValidationIssue>) {
    let link_count = description.links.len();
    let mut parent_joint_count = vec![0usize; link_count];

    for joint in &description.joints {
        if joint.parent >= link_count || joint.child >= link_count {
            issues.push(ValidationIssue {
                code: IssueCode::InvalidGraph,
                message: format!(
                    "joint '{}' references a link index outside 0..{link_count}",
                    joint.name
                ),
                subject: Some(joint.name.clone()),
            });
            continue;
        }
        if joint.parent >= joint.child {
            issues.push(ValidationIssue {
                code: IssueCode::InvalidGraph,
                message: format!(
                    "joint '{}' must connect a lower-index parent to a higher-index child \
                     (got {} -> {}); reorder the links so the graph stays acyclic",
                    joint.name, joint.parent, joint.child
                ),
                subject: Some(joint.name.clone()),
            });
            continue;
        }
        parent_joint_count[joint.child] += 1;
    }

    if parent_joint_count.first().copied().unwrap_or(0) > 0 {
        issues.push(ValidationIssue {
            code: IssueCode::InvalidGraph,
            message: format!(
                "root link '{}' must not be the child of any joint",
                description.link_name(0)
            ),
            subject: Some(description.links[0].name.clone()),
        });
    }
    for (index, count) in parent_joint_count.iter().enumerate().skip(1) {
        if *count == 0 {
            issues.push(ValidationIssue {
                code: IssueCode::InvalidGraph,
                message: format!(
                    "link '{}' is not connected to the rest of the robot (no parent joint)",
                    description.link_name(index)
                ),
                subject: Some(description.links[index].name.clone()),
            });
        } else if *count > 1 {
            issues.push(ValidationIssue {
                code: IssueCode::InvalidGraph,
                message: format!(
                    "link '{}' has {count} parent joints; exactly one is required",
                    description.link_name(index)
                ),
                subject: Some(description.links[index].name.clone()),
            });
        }
    }
}

fn check_completeness(description: &RobotDescription, issues: &mut Vec<ValidationIssue>) {
    for link in &description.links {
        if link.visual.is_none() {
            issues.push(ValidationIssue {
                code: IssueCode::MissingVisual,
                message: format!("link '{}' has no visual geometry", link.name),
                subject: Some(link.name.clone()),
            });
        }
        if link.collision.is_none() {
            issues.push(ValidationIssue {
                code: IssueCode::MissingCollision,
                message: format!(
                    "link '{}' has no collision geometry and would fall through the floor",
                    link.name
                ),
                subject: Some(link.name.clone()),
            });
        }
    }
}

fn check_clearance(
    description: &RobotDescription,
    config: &PipelineConfig,
    issues: &mut Vec<ValidationIssue>,
) {
    for joint in &description.joints {
        if !joint.joint_type.is_actuated() {
            continue;
        }
        let (Some(parent), Some(child)) = (
            description.links.get(joint.parent),
            description.links.get(joint.child),
        ) else {
            continue; // already reported by the graph check
        };
        let parent_radius = parent
            .collision
            .or(parent.visual)
            .map(|geometry| geometry.bounding_radius())
            .unwrap_or(0.0);
        let clearance = config.min_link_clearance.max(parent_radius);
        let offset = vector![joint.origin[0], joint.origin[1], joint.origin[2]].norm();
        if offset < clearance {
            issues.push(ValidationIssue {
                code: IssueCode::InsufficientClearance,
                message: format!(
                    "link '{}' is only {offset:.3}m from parent '{}'; offset must exceed \
                     {clearance:.2}m to avoid self-collision at spawn",
                    child.name, parent.name
                ),
                subject: Some(child.name.clone()),
            });
        }
    }
}

fn check_effort(
    description: &RobotDescription,
    config: &PipelineConfig,
    issues: &mut Vec<ValidationIssue>,
) {
    for joint in &description.joints {
        if !matches!(
            joint.joint_type,
            JointType::Revolute | JointType::Prismatic
        ) {
            continue;
        }
        if joint.limit.effort < config.min_joint_effort {
            issues.push(ValidationIssue {
                code: IssueCode::LowEffort,
                message: format!(
                    "joint '{}' effort {} is too weak to resist gravity; use at least {}",
                    joint.name, joint.limit.effort, config.min_joint_effort
                ),
                subject: Some(joint.name.clone()),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Terrain
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Terrain {
    Flat,
    Uneven,
    Stairs,
    Slope,
}

impl Terrain {
    /// Fixed stress-test order; results are reproducible run to run.
    const ALL: [Terrain; 4] = [Terrain::Flat, Terrain::Uneven, Terrain::Stairs, Terrain::Slope];

    fn name(self) -> &'static str {
        match self {
            Terrain::Flat => "flat",
            Terrain::Uneven => "uneven",
            Terrain::Stairs => "stairs",
            Terrain::Slope => "slope",
        }
    }

    /// Harder terrain earns a score bonus; surviving stairs is worth more
    /// than surviving a flat plane.
    fn multiplier(self) -> f32 {
        match self {
            Terrain::Flat => 1.0,
            Terrain::Slope => 1.15,
            Terrain::Stairs => 1.25,
            Terrain::Uneven => 1.30,
        }
    }

    fn spawn_height(self) -> f32 {
        match self {
            Terrain::Flat => 1.0,
            Terrain::Uneven => 1.2,
            Terrain::Stairs => 0.6,
            Terrain::Slope => 1.0,
        }
    }
}

impl std::fmt::Display for Terrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn ground_groups() -> InteractionGroups {
    InteractionGroups::new(GROUND_COLLISION_GROUP, ROBOT_COLLISION_GROUP)
}

/// Deterministic ground geometry for one terrain profile. Returns the
/// collider handles making up the ground so contact queries can tell ground
/// touches apart from anything else.
fn spawn_terrain(
    terrain: Terrain,
    bodies: &mut RigidBodySet,
    colliders: &mut ColliderSet,
) -> Vec<ColliderHandle> {
    // Every terrain sits on the same base slab so a robot wandering off the
    // feature never falls out of the world.
    let slab_body = bodies.insert(RigidBodyBuilder::fixed().build());
    let slab = ColliderBuilder::cuboid(420.0, 5.0, 420.0)
        .translation(vector![0.0, -5.0, 0.0])
        .friction(GROUND_FRICTION)
        .restitution(GROUND_RESTITUTION)
        .collision_groups(ground_groups())
        .build();
    let mut handles = vec![colliders.insert_with_parent(slab, slab_body, bodies)];

    match terrain {
        Terrain::Flat => {}
        Terrain::Uneven => {
            let mut rng = SmallRng::seed_from_u64(UNEVEN_TERRAIN_SEED);
            let heights = DMatrix::from_fn(UNEVEN_TERRAIN_CELLS, UNEVEN_TERRAIN_CELLS, |_, _| {
                rng.random::<f32>() * UNEVEN_BUMP_HEIGHT
            });
            let ground = bodies.insert(RigidBodyBuilder::fixed().build());
            let collider = ColliderBuilder::heightfield(
                heights,
                vector![UNEVEN_TERRAIN_EXTENT, 1.0, UNEVEN_TERRAIN_EXTENT],
            )
            .friction(GROUND_FRICTION)
            .restitution(GROUND_RESTITUTION)
            .collision_groups(ground_groups())
            .build();
            handles.push(colliders.insert_with_parent(collider, ground, bodies));
        }
        Terrain::Stairs => {
            for step in 0..STAIR_STEP_COUNT {
                let x = step as f32 * STAIR_STEP_DEPTH;
                let y = (step as f32 + 0.5) * STAIR_STEP_HEIGHT;
                let body = bodies.insert(
                    RigidBodyBuilder::fixed()
                        .translation(vector![x, y, 0.0])
                        .build(),
                );
                let collider = ColliderBuilder::cuboid(
                    STAIR_STEP_DEPTH * 0.5,
                    STAIR_STEP_HEIGHT * 0.5,
                    STAIR_STEP_WIDTH * 0.5,
                )
                .friction(0.8)
                .restitution(GROUND_RESTITUTION)
                .collision_groups(ground_groups())
                .build();
                handles.push(colliders.insert_with_parent(collider, body, bodies));
            }
        }
        Terrain::Slope => {
            let x = SLOPE_LENGTH * 0.5 * SLOPE_ANGLE_RAD.cos();
            let y = SLOPE_LENGTH * 0.5 * SLOPE_ANGLE_RAD.sin() + 0.05;
            let body = bodies.insert(
                RigidBodyBuilder::fixed()
                    .translation(vector![x, y, 0.0])
                    .rotation(vector![0.0, 0.0, SLOPE_ANGLE_RAD])
                    .build(),
            );
            let collider = ColliderBuilder::cuboid(SLOPE_LENGTH * 0.5, 0.05, SLOPE_WIDTH * 0.5)
                .friction(0.8)
                .restitution(GROUND_RESTITUTION)
                .collision_groups(ground_groups())
                .build();
            handles.push(colliders.insert_with_parent(collider, body, bodies));
        }
    }
    handles
}

// ---------------------------------------------------------------------------
// Simulation outcome
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Frame {
    t: f32,
    pos: [f32; 3],
    orn: [f32; 4],
    joints: Vec<f32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Trajectory {
    record_hz: f32,
    duration_seconds: f32,
    frame_count: usize,
    joint_names: Vec<String>,
    frames: Vec<Frame>,
}

/// Pose and bounding box of one link, captured for the sanity pass.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkSnapshot {
    name: String,
    position: [f32; 3],
    rotation: [f32; 4],
    half_extents: [f32; 3],
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulationOutcome {
    terrain: Terrain,
    duration_seconds: f32,
    motors_enabled: bool,
    final_position: [f32; 3],
    final_rotation: [f32; 4],
    /// Cosine of the tilt angle between the base's up vector and world up.
    tilt_cos: f32,
    /// Final horizontal displacement of the base from its spawn position.
    displacement: f32,
    /// Running maximum horizontal displacement over the whole horizon.
    max_displacement: f32,
    distance_from_origin: f32,
    diverged: bool,
    joint_names: Vec<String>,
    /// Designated ground-contact links (tree leaves).
    contact_links: Vec<String>,
    /// Subset of `contact_links` actually touching the ground at rest.
    grounded_links: Vec<String>,
    grounded_fraction: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trajectory: Option<Trajectory>,
    #[serde(skip)]
    spawn_snapshot: Vec<LinkSnapshot>,
    #[serde(skip)]
    settled_snapshot: Vec<LinkSnapshot>,
}

// ---------------------------------------------------------------------------
// Physics harness
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct SimOptions {
    terrain: Terrain,
    horizon_seconds: f32,
    actuate: bool,
    record: bool,
    divergence_distance: f32,
}

impl SimOptions {
    fn scoring(config: &PipelineConfig, terrain: Terrain, actuate: bool, record: bool) -> Self {
        Self {
            terrain,
            horizon_seconds: config.horizon_seconds,
            actuate,
            record,
            divergence_distance: config.divergence_distance,
        }
    }

    /// Spawn-and-settle check used by the repair loop: flat ground, short
    /// horizon, no motors, tighter divergence threshold.
    fn sanity(config: &PipelineConfig) -> Self {
        Self {
            terrain: Terrain::Flat,
            horizon_seconds: config.sanity_horizon_seconds,
            actuate: false,
            record: false,
            divergence_distance: config.sanity_divergence_distance,
        }
    }
}

struct SimLink {
    link_index: usize,
    body: RigidBodyHandle,
    collider: ColliderHandle,
    half_extents: Vector3<f32>,
}

struct JointActuator {
    name: String,
    joint: ImpulseJointHandle,
    parent_body: RigidBodyHandle,
    child_body: RigidBodyHandle,
    axis: Vector3<f32>,
    origin: Vector3<f32>,
    prismatic: bool,
    lower: f32,
    upper: f32,
    effort: f32,
    phase: f32,
}

struct SimWorld {
    pipeline: PhysicsPipeline,
    gravity: Vector3<f32>,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: BroadPhaseBvh,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    ground_colliders: Vec<ColliderHandle>,
    links: Vec<SimLink>,
    actuators: Vec<JointActuator>,
    base_handle: RigidBodyHandle,
    spawn: Vector3<f32>,
    spawn_snapshot: Vec<LinkSnapshot>,
}

impl SimWorld {
    fn new(
        description: &RobotDescription,
        terrain: Terrain,
        config: &PipelineConfig,
    ) -> Result<Self, SimError> {
        let mut pipeline = PhysicsPipeline::new();
        let gravity = vector![0.0, GRAVITY_Y, 0.0];
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = config.dt();
        integration_parameters.max_ccd_substeps = 4;

        let mut island_manager = IslandManager::new();
        let mut broad_phase = BroadPhaseBvh::new();
        let mut narrow_phase = NarrowPhase::new();
        let mut bodies = RigidBodySet::new();
        let mut colliders = ColliderSet::new();
        let mut impulse_joints = ImpulseJointSet::new();
        let mut multibody_joints = MultibodyJointSet::new();
        let mut ccd_solver = CCDSolver::new();

        if description.links.is_empty() {
            return Err(SimError::BackendLoad("description has no links".to_string()));
        }

        let ground_colliders = spawn_terrain(terrain, &mut bodies, &mut colliders);
        let spawn = vector![0.0, terrain.spawn_height(), 0.0];

        // Resolve world-space link centers by walking the arena in index
        // order; the index-monotonic joint invariant guarantees parents are
        // placed before their children.
        let mut centers: Vec<Vector3<f32>> = vec![spawn; description.links.len()];
        for joint in &description.joints {
            if joint.child >= centers.len() || joint.parent >= joint.child {
                return Err(SimError::BackendLoad(format!(
                    "joint '{}' references an unresolvable link pair",
                    joint.name
                )));
            }
            let offset = vector![joint.origin[0], joint.origin[1], joint.origin[2]];
            if !offset.iter().all(|v| v.is_finite()) {
                return Err(SimError::BackendLoad(format!(
                    "joint '{}' has a non-finite origin",
                    joint.name
                )));
            }
            centers[joint.child] = centers[joint.parent] + offset;
        }

        let mut links = Vec::with_capacity(description.links.len());
        for (index, link) in description.links.iter().enumerate() {
            let geometry = link.collision.ok_or_else(|| {
                SimError::BackendLoad(format!("link '{}' has no collision geometry", link.name))
            })?;
            if !geometry.is_plausible() {
                return Err(SimError::BackendLoad(format!(
                    "link '{}' has non-finite or non-positive geometry",
                    link.name
                )));
            }
            if !link.mass.is_finite() || link.mass <= 0.0 {
                return Err(SimError::BackendLoad(format!(
                    "link '{}' has implausible mass {}",
                    link.name, link.mass
                )));
            }
            let (body, collider) = insert_link_body(
                &mut bodies,
                &mut colliders,
                geometry,
                link.mass,
                centers[index],
            );
            links.push(SimLink {
                link_index: index,
                body,
                collider,
                half_extents: geometry.half_extents(),
            });
        }

        let movable_count = description
            .joints
            .iter()
            .filter(|joint| joint.joint_type.is_actuated())
            .count()
            .max(1);
        let mut actuators = Vec::new();
        let mut movable_seen = 0usize;
        for joint in &description.joints {
            let parent_body = links[joint.parent].body;
            let child_body = links[joint.child].body;
            let origin = vector![joint.origin[0], joint.origin[1], joint.origin[2]];
            let raw_axis = vector![joint.axis[0], joint.axis[1], joint.axis[2]];
            let axis = raw_axis
                .try_normalize(1e-6)
                .unwrap_or(vector![1.0, 0.0, 0.0]);
            let anchor1 = point![origin.x, origin.y, origin.z];
            let anchor2 = point![0.0, 0.0, 0.0];

            let handle = match joint.joint_type {
                JointType::Fixed => {
                    let fixed = FixedJointBuilder::new()
                        .local_anchor1(anchor1)
                        .local_anchor2(anchor2)
                        .contacts_enabled(false);
                    impulse_joints.insert(parent_body, child_body, fixed, true)
                }
                JointType::Revolute | JointType::Continuous => {
                    let mut revolute = RevoluteJointBuilder::new(UnitVector::new_normalize(axis))
                        .local_anchor1(anchor1)
                        .local_anchor2(anchor2)
                        .contacts_enabled(false);
                    if joint.joint_type == JointType::Revolute
                        && joint.limit.lower < joint.limit.upper
                    {
                        revolute = revolute.limits([joint.limit.lower, joint.limit.upper]);
                    }
                    impulse_joints.insert(parent_body, child_body, revolute, true)
                }
                JointType::Prismatic => {
                    let mut prismatic = PrismaticJointBuilder::new(UnitVector::new_normalize(axis))
                        .local_anchor1(anchor1)
                        .local_anchor2(anchor2)
                        .contacts_enabled(false);
                    if joint.limit.lower < joint.limit.upper {
                        prismatic = prismatic.limits([joint.limit.lower, joint.limit.upper]);
                    }
                    impulse_joints.insert(parent_body, child_body, prismatic, true)
                }
            };

            if joint.joint_type.is_actuated() {
                let motor_axis = if joint.joint_type == JointType::Prismatic {
                    JointAxis::LinX
                } else {
                    JointAxis::AngX
                };
                if let Some(joint_ref) = impulse_joints.get_mut(handle, false) {
                    joint_ref
                        .data
                        .set_motor_model(motor_axis, MotorModel::ForceBased);
                }
                let phase = 2.0 * std::f32::consts::PI * movable_seen as f32 / movable_count as f32;
                actuators.push(JointActuator {
                    name: joint.name.clone(),
                    joint: handle,
                    parent_body,
                    child_body,
                    axis,
                    origin,
                    prismatic: joint.joint_type == JointType::Prismatic,
                    lower: joint.limit.lower,
                    upper: joint.limit.upper,
                    effort: joint.limit.effort,
                    phase,
                });
                movable_seen += 1;
            }
        }

        // One settling step so contacts register before the spawn snapshot.
        pipeline.step(
            &gravity,
            &integration_parameters,
            &mut island_manager,
            &mut broad_phase,
            &mut narrow_phase,
            &mut bodies,
            &mut colliders,
            &mut impulse_joints,
            &mut multibody_joints,
            &mut ccd_solver,
            &(),
            &(),
        );

        let base_handle = links[0].body;
        let spawn_snapshot = snapshot_links(description, &links, &bodies);
        Ok(Self {
            pipeline,
            gravity,
            integration_parameters,
            island_manager,
            broad_phase,
            narrow_phase,
            bodies,
            colliders,
            impulse_joints,
            multibody_joints,
            ccd_solver,
            ground_colliders,
            links,
            actuators,
            base_handle,
            spawn,
            spawn_snapshot,
        })
    }

    fn step_once(&mut self) {
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &(),
        );
    }

    /// Periodic per-joint position targets with staggered phases, producing
    /// gait-like motion while respecting each joint's declared limits.
    fn apply_motors(&mut self, sim_time: f32, config: &PipelineConfig) {
        let omega = 2.0 * std::f32::consts::PI * config.motor_frequency_hz;
        for actuator in &self.actuators {
            let wave = (omega * sim_time + actuator.phase).sin();
            let target = if actuator.lower < actuator.upper {
                let midpoint = (actuator.lower + actuator.upper) * 0.5;
                let half_range = (actuator.upper - actuator.lower) * 0.5;
                midpoint + config.motor_amplitude.min(half_range) * wave
            } else {
                config.motor_amplitude * wave
            };
            let motor_axis = if actuator.prismatic {
                JointAxis::LinX
            } else {
                JointAxis::AngX
            };
            if let Some(joint) = self.impulse_joints.get_mut(actuator.joint, true) {
                joint
                    .data
                    .set_motor_position(motor_axis, target, MOTOR_STIFFNESS, JOINT_MOTOR_RESPONSE);
                joint.data.set_motor_max_force(motor_axis, actuator.effort);
            }
        }
    }

    fn base_position(&self) -> Vector3<f32> {
        self.bodies
            .get(self.base_handle)
            .map(|body| *body.translation())
            .unwrap_or(self.spawn)
    }

    fn base_rotation(&self) -> UnitQuaternion<f32> {
        self.bodies
            .get(self.base_handle)
            .map(|body| *body.rotation())
            .unwrap_or_else(UnitQuaternion::identity)
    }

    /// Signed joint value along the joint axis, reconstructed from the two
    /// body poses: rotation angle for hinges, axial offset for sliders.
    fn joint_value(&self, actuator: &JointActuator) -> f32 {
        let Some(parent) = self.bodies.get(actuator.parent_body) else {
            return 0.0;
        };
        let Some(child) = self.bodies.get(actuator.child_body) else {
            return 0.0;
        };
        if actuator.prismatic {
            let relative =
                parent.rotation().inverse() * (child.translation() - parent.translation());
            (relative - actuator.origin).dot(&actuator.axis)
        } else {
            let relative = parent.rotation().inverse() * child.rotation();
            relative.scaled_axis().dot(&actuator.axis)
        }
    }

    fn capture_frame(&self, sim_time: f32) -> Frame {
        let position = self.base_position();
        let rotation = self.base_rotation();
        let joints = self
            .actuators
            .iter()
            .map(|actuator| self.joint_value(actuator))
            .collect();
        Frame {
            t: sim_time,
            pos: [position.x, position.y, position.z],
            orn: [rotation.i, rotation.j, rotation.k, rotation.w],
            joints,
        }
    }

    fn grounded_links(&self, description: &RobotDescription) -> Vec<String> {
        let mut grounded = Vec::new();
        for index in description.contact_link_indices() {
            let Some(link) = self.links.iter().find(|link| link.link_index == index) else {
                continue;
            };
            let touching = self.ground_colliders.iter().any(|ground| {
                self.narrow_phase
                    .contact_pair(link.collider, *ground)
                    .map(|pair| pair.has_any_active_contact)
                    .unwrap_or(false)
            });
            if touching {
                grounded.push(description.link_name(index).to_string());
            }
        }
        grounded
    }
}

fn insert_link_body(
    bodies: &mut RigidBodySet,
    colliders: &mut ColliderSet,
    geometry: Geometry,
    mass: f32,
    center: Vector3<f32>,
) -> (RigidBodyHandle, ColliderHandle) {
    let body = RigidBodyBuilder::dynamic()
        .translation(center)
        .linear_damping(LINK_LINEAR_DAMPING)
        .angular_damping(LINK_ANGULAR_DAMPING)
        .ccd_enabled(true)
        .build();
    let handle = bodies.insert(body);
    let shape = match geometry {
        Geometry::Box { size } => ColliderBuilder::cuboid(size[0] * 0.5, size[1] * 0.5, size[2] * 0.5),
        Geometry::Cylinder { radius, length } => ColliderBuilder::cylinder(length * 0.5, radius),
        Geometry::Sphere { radius } => ColliderBuilder::ball(radius),
    };
    let collider = shape
        .mass(mass)
        .friction(GROUND_FRICTION)
        .restitution(GROUND_RESTITUTION)
        .collision_groups(InteractionGroups::new(
            ROBOT_COLLISION_GROUP,
            GROUND_COLLISION_GROUP,
        ))
        .build();
    let collider_handle = colliders.insert_with_parent(collider, handle, bodies);
    (handle, collider_handle)
}

fn snapshot_links(
    description: &RobotDescription,
    links: &[SimLink],
    bodies: &RigidBodySet,
) -> Vec<LinkSnapshot> {
    links
        .iter()
        .map(|link| {
            let (position, rotation) = bodies
                .get(link.body)
                .map(|body| (*body.translation(), *body.rotation()))
                .unwrap_or_else(|| (vector![0.0, 0.0, 0.0], UnitQuaternion::identity()));
            LinkSnapshot {
                name: description.link_name(link.link_index).to_string(),
                position: [position.x, position.y, position.z],
                rotation: [rotation.i, rotation.j, rotation.k, rotation.w],
                half_extents: [link.half_extents.x, link.half_extents.y, link.half_extents.z],
            }
        })
        .collect()
}

/// Load a validated description onto the chosen terrain and step rigid-body
/// dynamics for the requested horizon. Divergence stops the run early; no
/// amount of further simulation recovers meaningful data after a blow-up.
fn simulate(
    description: &RobotDescription,
    options: &SimOptions,
    config: &PipelineConfig,
    cancel: &AtomicBool,
) -> Result<SimulationOutcome, SimError> {
    let mut world = SimWorld::new(description, options.terrain, config)?;

    let dt = config.dt();
    let total_steps = (options.horizon_seconds * config.step_rate_hz).round() as usize;
    let steps_per_frame = (config.step_rate_hz / config.record_hz).round().max(1.0) as usize;
    let max_frames = (options.horizon_seconds * config.record_hz).floor() as usize;
    let wall_deadline = Duration::from_secs(config.sim_wall_clock_timeout_seconds);
    let started = Instant::now();

    let mut frames: Vec<Frame> = Vec::new();
    let mut diverged = false;
    let mut max_displacement = 0.0f32;

    for step in 0..total_steps {
        if cancel.load(Ordering::Relaxed) {
            return Err(SimError::Cancelled);
        }
        // A hung or runaway world is catastrophic, same as a blow-up.
        if step % 256 == 0 && started.elapsed() > wall_deadline {
            warn!(
                "simulation exceeded {}s wall clock; treating as divergence",
                config.sim_wall_clock_timeout_seconds
            );
            diverged = true;
            break;
        }

        let sim_time = step as f32 * dt;
        if options.actuate {
            world.apply_motors(sim_time, config);
        }
        world.step_once();

        let position = world.base_position();
        let horizontal = horizontal_displacement(position, world.spawn);
        max_displacement = max_displacement.max(horizontal);
        if (position - world.spawn).norm() > options.divergence_distance {
            diverged = true;
            break;
        }

        if options.record && step % steps_per_frame == 0 && frames.len() < max_frames {
            frames.push(world.capture_frame(sim_time));
        }
    }

    let position = world.base_position();
    let rotation = world.base_rotation();
    let up = rotation * vector![0.0, 1.0, 0.0];
    let displacement = horizontal_displacement(position, world.spawn);
    let grounded_links = world.grounded_links(description);
    let contact_links: Vec<String> = description
        .contact_link_indices()
        .into_iter()
        .map(|index| description.link_name(index).to_string())
        .collect();
    let grounded_fraction = if contact_links.is_empty() {
        0.0
    } else {
        grounded_links.len() as f32 / contact_links.len() as f32
    };
    let settled_snapshot = snapshot_links(description, &world.links, &world.bodies);
    let joint_names: Vec<String> = world
        .actuators
        .iter()
        .map(|actuator| actuator.name.clone())
        .collect();

    let trajectory = options.record.then(|| Trajectory {
        record_hz: config.record_hz,
        duration_seconds: options.horizon_seconds,
        frame_count: frames.len(),
        joint_names: joint_names.clone(),
        frames,
    });

    Ok(SimulationOutcome {
        terrain: options.terrain,
        duration_seconds: options.horizon_seconds,
        motors_enabled: options.actuate,
        final_position: [position.x, position.y, position.z],
        final_rotation: [rotation.i, rotation.j, rotation.k, rotation.w],
        tilt_cos: up.y,
        displacement,
        max_displacement,
        distance_from_origin: position.norm(),
        diverged,
        joint_names,
        contact_links,
        grounded_links,
        grounded_fraction,
        trajectory,
        spawn_snapshot: world.spawn_snapshot.clone(),
        settled_snapshot,
    })
}

fn horizontal_displacement(position: Vector3<f32>, spawn: Vector3<f32>) -> f32 {
    let dx = position.x - spawn.x;
    let dz = position.z - spawn.z;
    (dx * dx + dz * dz).sqrt()
}

// ---------------------------------------------------------------------------
// Sanity checker
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SanityReport {
    passed: bool,
    issues: Vec<String>,
    spawn_self_collisions: Vec<[String; 2]>,
    settled_self_collisions: Vec<[String; 2]>,
}

/// World-axis-aligned bounding half extents of a rotated box:
/// ext_i = sum_j |R_ij| * h_j.
fn world_aabb_extents(rotation: &UnitQuaternion<f32>, half: &[f32; 3]) -> Vector3<f32> {
    let m = rotation.to_rotation_matrix();
    let m = m.matrix();
    vector![
        m[(0, 0)].abs() * half[0] + m[(0, 1)].abs() * half[1] + m[(0, 2)].abs() * half[2],
        m[(1, 0)].abs() * half[0] + m[(1, 1)].abs() * half[1] + m[(1, 2)].abs() * half[2],
        m[(2, 0)].abs() * half[0] + m[(2, 1)].abs() * half[1] + m[(2, 2)].abs() * half[2]
    ]
}

fn overlapping_pairs(
    snapshot: &[LinkSnapshot],
    adjacent: &HashSet<(usize, usize)>,
) -> Vec<[String; 2]> {
    let mut overlaps = Vec::new();
    for i in 0..snapshot.len() {
        for j in (i + 1)..snapshot.len() {
            if adjacent.contains(&(i, j)) {
                continue;
            }
            let a = &snapshot[i];
            let b = &snapshot[j];
            let rot_a = UnitQuaternion::new_normalize(Quaternion::new(
                a.rotation[3],
                a.rotation[0],
                a.rotation[1],
                a.rotation[2],
            ));
            let rot_b = UnitQuaternion::new_normalize(Quaternion::new(
                b.rotation[3],
                b.rotation[0],
                b.rotation[1],
                b.rotation[2],
            ));
            let ext_a = world_aabb_extents(&rot_a, &a.half_extents);
            let ext_b = world_aabb_extents(&rot_b, &b.half_extents);
            let overlap = (0..3).all(|axis| {
                let gap = (a.position[axis] - b.position[axis]).abs()
                    - (ext_a[axis] + ext_b[axis]);
                gap < -SELF_OVERLAP_MARGIN
            });
            if overlap {
                overlaps.push([a.name.clone(), b.name.clone()]);
            }
        }
    }
    overlaps
}

/// Geometric plausibility pass over a settle run. Works entirely on link
/// snapshots so it needs no live physics state.
fn check_sanity(description: &RobotDescription, outcome: &SimulationOutcome) -> SanityReport {
    let adjacent = description.adjacent_pairs();
    let spawn_self_collisions = overlapping_pairs(&outcome.spawn_snapshot, &adjacent);
    let settled_self_collisions = overlapping_pairs(&outcome.settled_snapshot, &adjacent);

    let mut issues = Vec::new();
    for [a, b] in &spawn_self_collisions {
        issues.push(format!("links '{a}' and '{b}' interpenetrate at spawn"));
    }
    for [a, b] in &settled_self_collisions {
        issues.push(format!("links '{a}' and '{b}' interpenetrate after settling"));
    }
    if outcome.diverged {
        issues.push("simulation diverged during the settle run".to_string());
    }
    if outcome.tilt_cos < TILT_FALLEN_THRESHOLD {
        issues.push(format!(
            "robot fell over while settling (tilt cosine {:.2})",
            outcome.tilt_cos
        ));
    }
    if outcome.final_position[1] < FALL_THROUGH_HEIGHT {
        issues.push(format!(
            "robot sank below the ground plane (y = {:.2})",
            outcome.final_position[1]
        ));
    }

    SanityReport {
        passed: issues.is_empty(),
        issues,
        spawn_self_collisions,
        settled_self_collisions,
    }
}

// ---------------------------------------------------------------------------
// Score engine
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Score {
    stability: f32,
    uprightness: f32,
    grounding: f32,
    terrain: Terrain,
    terrain_multiplier: f32,
    total: f32,
    label: String,
}

fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Exponential falloff with horizontal drift: standing still scores 100,
/// ten meters of drift is down to ~5. A diverged run scores zero outright.
fn score_stability(outcome: &SimulationOutcome) -> f32 {
    if outcome.diverged {
        return 0.0;
    }
    let drift = outcome.displacement.min(MAX_SCORED_DISPLACEMENT);
    100.0 * (-STABILITY_DECAY * drift / MAX_SCORED_DISPLACEMENT).exp()
}

fn score_uprightness(outcome: &SimulationOutcome) -> f32 {
    if outcome.diverged {
        return 0.0;
    }
    outcome.tilt_cos.clamp(0.0, 1.0) * 100.0
}

fn score_grounding(outcome: &SimulationOutcome) -> f32 {
    if outcome.diverged {
        return 0.0;
    }
    outcome.grounded_fraction.clamp(0.0, 1.0) * 100.0
}

fn score_label(total: f32) -> &'static str {
    if total >= 90.0 {
        "Excellent"
    } else if total >= 75.0 {
        "Great"
    } else if total >= 60.0 {
        "Good"
    } else if total >= 40.0 {
        "Fair"
    } else if total >= 20.0 {
        "Poor"
    } else {
        "Unstable"
    }
}

fn compute_score(outcome: &SimulationOutcome) -> Score {
    let stability = score_stability(outcome);
    let uprightness = score_uprightness(outcome);
    let grounding = score_grounding(outcome);
    let multiplier = outcome.terrain.multiplier();
    let weighted = WEIGHT_STABILITY * stability
        + WEIGHT_UPRIGHTNESS * uprightness
        + WEIGHT_GROUNDING * grounding;
    let total = (weighted * multiplier).clamp(0.0, 100.0);
    Score {
        stability: round1(stability),
        uprightness: round1(uprightness),
        grounding: round1(grounding),
        terrain: outcome.terrain,
        terrain_multiplier: round2(multiplier),
        total: round1(total),
        label: score_label(total).to_string(),
    }
}

// ---------------------------------------------------------------------------
// Stress test runner
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct TerrainRun {
    terrain: Terrain,
    completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<Score>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StressSummary {
    average_score: f32,
    terrains_passed: usize,
    terrains_total: usize,
    best_terrain: Option<Terrain>,
    worst_terrain: Option<Terrain>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StressReport {
    runs: Vec<TerrainRun>,
    summary: StressSummary,
}

fn summarize_stress(runs: &[TerrainRun]) -> StressSummary {
    // Only completed runs count as passed; a diverged run carries a zeroed
    // score for the report but is still a failure.
    let scored: Vec<(&TerrainRun, f32)> = runs
        .iter()
        .filter(|run| run.completed)
        .filter_map(|run| run.score.as_ref().map(|score| (run, score.total)))
        .collect();
    let average = if scored.is_empty() {
        0.0
    } else {
        scored.iter().map(|(_, total)| total).sum::<f32>() / scored.len() as f32
    };
    let best = scored
        .iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(run, _)| run.terrain);
    let worst = scored
        .iter()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(run, _)| run.terrain);
    StressSummary {
        average_score: round1(average),
        terrains_passed: scored.len(),
        terrains_total: runs.len(),
        best_terrain: best,
        worst_terrain: worst,
    }
}

/// Score the robot across every terrain in a fixed order. A failure on one
/// terrain is recorded and the remaining terrains still run.
fn stress_test(
    description: &RobotDescription,
    config: &PipelineConfig,
    cancel: &AtomicBool,
) -> Result<StressReport, SimError> {
    let mut runs = Vec::with_capacity(Terrain::ALL.len());
    for terrain in Terrain::ALL {
        if cancel.load(Ordering::Relaxed) {
            return Err(SimError::Cancelled);
        }
        let options = SimOptions::scoring(config, terrain, true, false);
        match simulate(description, &options, config, cancel) {
            Ok(outcome) => {
                let diverged = outcome.diverged;
                let score = compute_score(&outcome);
                if diverged {
                    warn!("stress run on {terrain} diverged");
                } else {
                    info!(
                        "stress run on {} scored {:.1} ({})",
                        terrain, score.total, score.label
                    );
                }
                runs.push(TerrainRun {
                    terrain,
                    completed: !diverged,
                    error: diverged.then(|| "simulation diverged".to_string()),
                    score: Some(score),
                });
            }
            Err(SimError::Cancelled) => return Err(SimError::Cancelled),
            Err(err) => {
                warn!("stress run on {terrain} failed: {err}");
                runs.push(TerrainRun {
                    terrain,
                    completed: false,
                    error: Some(err.to_string()),
                    score: None,
                });
            }
        }
    }
    let summary = summarize_stress(&runs);
    Ok(StressReport { runs, summary })
}

// ---------------------------------------------------------------------------
// Descriptor producer
// ---------------------------------------------------------------------------

/// External capability that turns a prompt into a raw robot description.
/// The pipeline never looks behind this seam; tests script it directly.
trait DescriptorProducer: Send + Sync {
    fn produce(&self, prompt: &str, feedback: Option<&str>) -> Result<String, ProducerError>;
}

/// Pull the first balanced JSON object out of a chatty model reply, ignoring
/// markdown fences and surrounding prose.
fn extract_description(raw: &str) -> Option<String> {
    let cleaned = raw.replace("```json", "\n").replace("```", "\n");
    let start = cleaned.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in cleaned[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(cleaned[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Blocking OpenAI-compatible chat-completions client. Runs inside
/// `spawn_blocking` so a slow model never stalls the async runtime.
struct OpenAiProducer {
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OpenAiProducer {
    fn from_env(config: &PipelineConfig) -> Option<Self> {
        let api_key = std::env::var(ENV_OPENAI_API_KEY).ok()?;
        if api_key.is_empty() {
            return None;
        }
        let base_url = std::env::var(ENV_OPENAI_BASE_URL)
            .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string());
        let model =
            std::env::var(ENV_OPENAI_MODEL).unwrap_or_else(|_| DEFAULT_OPENAI_MODEL.to_string());
        Some(Self {
            api_key,
            base_url,
            model,
            timeout: Duration::from_secs(config.producer_timeout_seconds),
        })
    }
}

impl DescriptorProducer for OpenAiProducer {
    fn produce(&self, prompt: &str, feedback: Option<&str>) -> Result<String, ProducerError> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": SYSTEM_PROMPT,
        })];
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));
        if let Some(feedback) = feedback {
            messages.push(serde_json::json!({ "role": "user", "content": feedback }));
        }
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.7,
        });

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = ureq::post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .timeout(self.timeout)
            .send_json(body)
            .map_err(|err| match err {
                ureq::Error::Transport(transport)
                    if transport.to_string().contains("timed out") =>
                {
                    ProducerError::Timeout
                }
                other => ProducerError::Request(other.to_string()),
            })?;

        let payload: serde_json::Value = response
            .into_json()
            .map_err(|err| ProducerError::Request(err.to_string()))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(ProducerError::Empty)?;
        extract_description(content).ok_or(ProducerError::Empty)
    }
}

// ---------------------------------------------------------------------------
// Repair orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
enum FailureKind {
    Producer,
    Validation,
    Sanity,
    Simulation,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepairAttempt {
    index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_description: Option<String>,
    failure: FailureKind,
    feedback: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionOutcome {
    accepted: bool,
    attempts_used: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sanity: Option<SanityReport>,
    /// Score of the accepted description's settle run on flat terrain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<Score>,
    history: Vec<RepairAttempt>,
}

/// Count how many limbs the prompt asks for. "quadruped" and friends count,
/// as do leading numerals ("6 legged walker").
fn detect_limb_count(prompt: &str) -> Option<usize> {
    let lower = prompt.to_lowercase();
    for (word, count) in [
        ("biped", 2),
        ("quadruped", 4),
        ("hexapod", 6),
        ("octopod", 8),
        ("spider", 8),
    ] {
        if lower.contains(word) {
            return Some(count);
        }
    }
    for (needle, count) in [
        ("two leg", 2),
        ("2 leg", 2),
        ("four leg", 4),
        ("4 leg", 4),
        ("six leg", 6),
        ("6 leg", 6),
        ("eight leg", 8),
        ("8 leg", 8),
    ] {
        if lower.contains(needle) {
            return Some(count);
        }
    }
    None
}

/// Spell out per-limb mount points so the producer does not stack every leg
/// at the same origin. Mirrors the sort of decomposition a person sketches
/// before modelling a walker.
fn build_limb_hint(limb_count: usize) -> String {
    let mut lines = vec![format!(
        "Decompose the robot into a central body (bounding radius about {LIMB_HINT_BODY_RADIUS} m) \
         and {limb_count} limbs. Suggested mount points around the body:"
    )];
    for limb in 0..limb_count {
        let angle = 2.0 * std::f32::consts::PI * limb as f32 / limb_count as f32;
        let x = LIMB_HINT_BODY_RADIUS * 1.5 * angle.cos();
        let z = LIMB_HINT_BODY_RADIUS * 1.5 * angle.sin();
        lines.push(format!(
            "- limb {}: attach at [{:.2}, -0.05, {:.2}], axis [0, 1, 0] for the hip swing",
            limb + 1,
            x,
            z
        ));
    }
    lines.push(
        "Give every limb its own links and joints; never reuse one link for two limbs.".to_string(),
    );
    lines.join("\n")
}

fn validation_feedback(result: &ValidationResult) -> String {
    let mut lines = vec!["The previous description failed validation:".to_string()];
    for issue in &result.issues {
        match &issue.subject {
            Some(subject) => lines.push(format!("- [{}] {} ({})", issue.code, issue.message, subject)),
            None => lines.push(format!("- [{}] {}", issue.code, issue.message)),
        }
    }
    lines.push("Fix every listed problem and resend the full corrected JSON.".to_string());
    lines.join("\n")
}

fn sanity_feedback(report: &SanityReport) -> String {
    let mut lines =
        vec!["The previous robot failed a physical plausibility check:".to_string()];
    for issue in &report.issues {
        lines.push(format!("- {issue}"));
    }
    for suggestion in sanity_suggestions(report) {
        lines.push(format!("Suggestion: {suggestion}"));
    }
    lines.push("Resend the full corrected JSON.".to_string());
    lines.join("\n")
}

fn sanity_suggestions(report: &SanityReport) -> Vec<String> {
    let mut suggestions = Vec::new();
    if !report.spawn_self_collisions.is_empty() || !report.settled_self_collisions.is_empty() {
        suggestions
            .push("increase joint origin offsets so sibling links spawn further apart".to_string());
    }
    if report.issues.iter().any(|issue| issue.contains("fell over")) {
        suggestions.push(
            "widen the support polygon: move contact links outward and lower the body mass"
                .to_string(),
        );
    }
    if report.issues.iter().any(|issue| issue.contains("diverged")) {
        suggestions
            .push("reduce joint effort limits and link masses to calm the dynamics".to_string());
    }
    suggestions
}

fn producer_feedback(err: &ProducerError) -> String {
    format!(
        "Your previous reply could not be used ({err}). Respond with ONLY the JSON robot object."
    )
}

struct RepairOrchestrator<'a> {
    producer: &'a dyn DescriptorProducer,
    config: &'a PipelineConfig,
}

impl<'a> RepairOrchestrator<'a> {
    fn new(producer: &'a dyn DescriptorProducer, config: &'a PipelineConfig) -> Self {
        Self { producer, config }
    }

    /// Drive generate -> validate -> settle-check until a description passes
    /// or the attempt budget runs out. Consecutive infrastructure failures
    /// (producer transport errors, physics load errors) escalate instead of
    /// burning the whole budget on a dead backend.
    fn orchestrate(&self, prompt: &str, cancel: &AtomicBool) -> Result<SessionOutcome, SessionError> {
        let mut history: Vec<RepairAttempt> = Vec::new();
        let mut feedback: Option<String> = None;
        let mut consecutive_backend_failures = 0usize;
        let mut last_backend_error = String::new();

        let limb_hint = detect_limb_count(prompt).map(build_limb_hint);

        for attempt in 0..self.config.max_attempts {
            if cancel.load(Ordering::Relaxed) {
                return Err(SessionError::Cancelled);
            }

            let turn_feedback = match (&feedback, attempt) {
                (Some(text), _) => Some(text.clone()),
                (None, 0) => limb_hint.clone(),
                (None, _) => None,
            };

            info!("attempt {}/{}", attempt + 1, self.config.max_attempts);
            let raw = match self.producer.produce(prompt, turn_feedback.as_deref()) {
                Ok(raw) => {
                    consecutive_backend_failures = 0;
                    raw
                }
                Err(err @ (ProducerError::Timeout | ProducerError::Request(_))) => {
                    consecutive_backend_failures += 1;
                    last_backend_error = err.to_string();
                    warn!(
                        "producer failure {}/{}: {err}",
                        consecutive_backend_failures, self.config.max_backend_failures
                    );
                    if consecutive_backend_failures >= self.config.max_backend_failures {
                        return Err(SessionError::BackendFailure {
                            count: consecutive_backend_failures,
                            last: last_backend_error,
                        });
                    }
                    history.push(RepairAttempt {
                        index: attempt,
                        raw_description: None,
                        failure: FailureKind::Producer,
                        feedback: producer_feedback(&err),
                    });
                    continue;
                }
                Err(err @ ProducerError::Empty) => {
                    consecutive_backend_failures = 0;
                    let text = producer_feedback(&err);
                    history.push(RepairAttempt {
                        index: attempt,
                        raw_description: None,
                        failure: FailureKind::Producer,
                        feedback: text.clone(),
                    });
                    feedback = Some(text);
                    continue;
                }
            };

            if cancel.load(Ordering::Relaxed) {
                return Err(SessionError::Cancelled);
            }

            let validation = validate_description(&raw, self.config);
            if !validation.passed {
                let text = validation_feedback(&validation);
                info!(
                    "attempt {} failed validation with {} issue(s)",
                    attempt + 1,
                    validation.issues.len()
                );
                history.push(RepairAttempt {
                    index: attempt,
                    raw_description: Some(raw),
                    failure: FailureKind::Validation,
                    feedback: text.clone(),
                });
                feedback = Some(text);
                continue;
            }
            let Some(description) = validation.description else {
                continue;
            };

            let options = SimOptions::sanity(self.config);
            let outcome = match simulate(&description, &options, self.config, cancel) {
                Ok(outcome) => outcome,
                Err(SimError::Cancelled) => return Err(SessionError::Cancelled),
                Err(err @ SimError::BackendLoad(_)) => {
                    consecutive_backend_failures += 1;
                    last_backend_error = err.to_string();
                    warn!(
                        "physics load failure {}/{}: {err}",
                        consecutive_backend_failures, self.config.max_backend_failures
                    );
                    if consecutive_backend_failures >= self.config.max_backend_failures {
                        return Err(SessionError::BackendFailure {
                            count: consecutive_backend_failures,
                            last: last_backend_error,
                        });
                    }
                    history.push(RepairAttempt {
                        index: attempt,
                        raw_description: Some(raw),
                        failure: FailureKind::Simulation,
                        feedback: err.to_string(),
                    });
                    continue;
                }
            };

            let sanity = check_sanity(&description, &outcome);
            if sanity.passed {
                info!("attempt {} accepted", attempt + 1);
                return Ok(SessionOutcome {
                    accepted: true,
                    attempts_used: attempt + 1,
                    raw_description: Some(raw),
                    sanity: Some(sanity),
                    score: Some(compute_score(&outcome)),
                    history,
                });
            }

            let text = sanity_feedback(&sanity);
            info!(
                "attempt {} failed sanity with {} issue(s)",
                attempt + 1,
                sanity.issues.len()
            );
            history.push(RepairAttempt {
                index: attempt,
                raw_description: Some(raw),
                failure: FailureKind::Sanity,
                feedback: text.clone(),
            });
            feedback = Some(text);
        }

        let attempts_used = self.config.max_attempts;
        warn!("attempt budget exhausted after {attempts_used} tries");
        Ok(SessionOutcome {
            accepted: false,
            attempts_used,
            raw_description: None,
            sanity: None,
            score: None,
            history,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP application
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RobotRecord {
    id: String,
    prompt: String,
    created_at: u64,
    raw_description: String,
    description: RobotDescription,
    attempts_used: usize,
}

#[derive(Clone)]
struct AppState {
    config: Arc<PipelineConfig>,
    producer: Option<Arc<dyn DescriptorProducer>>,
    sim_slots: Arc<Semaphore>,
    robots: Arc<Mutex<HashMap<String, RobotRecord>>>,
    next_robot_id: Arc<AtomicUsize>,
}

impl AppState {
    fn new(config: PipelineConfig, producer: Option<Arc<dyn DescriptorProducer>>) -> Self {
        let worker_limit = resolve_sim_worker_limit();
        info!("allowing up to {worker_limit} concurrent simulations");
        Self {
            config: Arc::new(config),
            producer,
            sim_slots: Arc::new(Semaphore::new(worker_limit)),
            robots: Arc::new(Mutex::new(HashMap::new())),
            next_robot_id: Arc::new(AtomicUsize::new(1)),
        }
    }

    async fn acquire_sim_slot(&self) -> Result<OwnedSemaphorePermit, (StatusCode, String)> {
        self.sim_slots.clone().acquire_owned().await.map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "simulation workers are shutting down".to_string(),
            )
        })
    }

    fn mint_robot_id(&self) -> String {
        let serial = self.next_robot_id.fetch_add(1, Ordering::Relaxed);
        format!("robot-{serial}")
    }
}

fn resolve_sim_worker_limit() -> usize {
    if let Ok(raw) = std::env::var(ENV_SIM_WORKER_LIMIT)
        && let Ok(value) = raw.parse::<usize>()
        && value > 0
    {
        return value;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(8)
}

fn resolve_bind_port() -> u16 {
    if let Ok(raw) = std::env::var(ENV_BIND_PORT)
        && let Ok(value) = raw.parse::<u16>()
    {
        return value;
    }
    DEFAULT_BIND_PORT
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    robot_id: Option<String>,
    attempts_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<RobotDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sanity: Option<SanityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    score: Option<Score>,
    history: Vec<RepairAttempt>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateRequest {
    #[serde(default)]
    robot_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    terrain: Option<Terrain>,
    #[serde(default = "default_true")]
    actuate: bool,
    #[serde(default = "default_true")]
    record: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    outcome: SimulationOutcome,
    score: Score,
    sanity: SanityReport,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StressRequest {
    #[serde(default)]
    robot_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let config = PipelineConfig::load();

    let producer: Option<Arc<dyn DescriptorProducer>> = OpenAiProducer::from_env(&config)
        .map(|producer| Arc::new(producer) as Arc<dyn DescriptorProducer>);
    if producer.is_none() {
        warn!("no {ENV_OPENAI_API_KEY} set; /api/generate is disabled");
    }

    let state = AppState::new(config, producer);

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/generate", post(generate_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/stress", post(stress_handler))
        .route("/api/history", get(history_handler))
        .route("/api/robot/{id}", get(robot_handler))
        .route("/api/robot/{id}", delete(delete_robot_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr: SocketAddr = match format!("{DEFAULT_BIND_HOST}:{}", resolve_bind_port()).parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid bind address: {err}");
            std::process::exit(1);
        }
    };
    info!("roboforge listening on http://{addr}");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = axum::serve(listener, app).await {
        error!("server exited unexpectedly: {err}");
        std::process::exit(1);
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, (StatusCode, String)> {
    let Some(producer) = state.producer.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("no descriptor producer configured; set {ENV_OPENAI_API_KEY}"),
        ));
    };
    if request.prompt.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "prompt must not be empty".to_string()));
    }

    let _permit = state.acquire_sim_slot().await?;
    let config = state.config.clone();
    let prompt = request.prompt.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let cancel = AtomicBool::new(false);
        let orchestrator = RepairOrchestrator::new(producer.as_ref(), &config);
        orchestrator.orchestrate(&prompt, &cancel)
    })
    .await
    .map_err(|err| {
        error!("generation worker panicked: {err}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "generation worker failed".to_string(),
        )
    })?
    .map_err(|err| match err {
        SessionError::BackendFailure { .. } => (StatusCode::BAD_GATEWAY, err.to_string()),
        SessionError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    })?;

    let mut response = GenerateResponse {
        accepted: outcome.accepted,
        robot_id: None,
        attempts_used: outcome.attempts_used,
        description: None,
        sanity: outcome.sanity,
        score: outcome.score,
        history: outcome.history,
    };

    if let Some(raw) = outcome.raw_description
        && let Ok(description) = parse_description(&raw)
    {
        let id = state.mint_robot_id();
        let record = RobotRecord {
            id: id.clone(),
            prompt: request.prompt,
            created_at: unix_now(),
            raw_description: raw,
            description: description.clone(),
            attempts_used: outcome.attempts_used,
        };
        if let Ok(mut robots) = state.robots.lock() {
            robots.insert(id.clone(), record);
        }
        response.robot_id = Some(id);
        response.description = Some(description);
    }

    Ok(Json(response))
}

/// Resolve the description for a simulate/stress request: either a stored
/// robot id or an inline raw description, never both absent.
fn resolve_description(
    state: &AppState,
    robot_id: Option<&str>,
    inline: Option<&str>,
) -> Result<RobotDescription, (StatusCode, String)> {
    if let Some(id) = robot_id {
        let robots = state.robots.lock().map_err(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "robot store unavailable".to_string(),
            )
        })?;
        return robots
            .get(id)
            .map(|record| record.description.clone())
            .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown robot id '{id}'")));
    }
    let Some(raw) = inline else {
        return Err((
            StatusCode::BAD_REQUEST,
            "provide either robotId or description".to_string(),
        ));
    };
    let validation = validate_description(raw, &state.config);
    if !validation.passed {
        let detail = serde_json::to_string(&validation.issues).unwrap_or_default();
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("description failed validation: {detail}"),
        ));
    }
    validation.description.ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "validation passed without a description".to_string(),
        )
    })
}

async fn simulate_handler(
    State(state): State<AppState>,
    Json(request): Json<SimulateRequest>,
) -> Result<Json<SimulateResponse>, (StatusCode, String)> {
    let description =
        resolve_description(&state, request.robot_id.as_deref(), request.description.as_deref())?;
    let terrain = request.terrain.unwrap_or(Terrain::Flat);

    let _permit = state.acquire_sim_slot().await?;
    let config = state.config.clone();
    let (outcome, sanity) = tokio::task::spawn_blocking(move || {
        let cancel = AtomicBool::new(false);
        let options = SimOptions::scoring(&config, terrain, request.actuate, request.record);
        let outcome = simulate(&description, &options, &config, &cancel)?;
        let sanity = check_sanity(&description, &outcome);
        Ok::<_, SimError>((outcome, sanity))
    })
    .await
    .map_err(|err| {
        error!("simulation worker panicked: {err}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "simulation worker failed".to_string(),
        )
    })?
    .map_err(|err| (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()))?;

    let score = compute_score(&outcome);
    Ok(Json(SimulateResponse { outcome, score, sanity }))
}

async fn stress_handler(
    State(state): State<AppState>,
    Json(request): Json<StressRequest>,
) -> Result<Json<StressReport>, (StatusCode, String)> {
    let description =
        resolve_description(&state, request.robot_id.as_deref(), request.description.as_deref())?;

    let _permit = state.acquire_sim_slot().await?;
    let config = state.config.clone();
    let report = tokio::task::spawn_blocking(move || {
        let cancel = AtomicBool::new(false);
        stress_test(&description, &config, &cancel)
    })
    .await
    .map_err(|err| {
        error!("stress worker panicked: {err}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "stress worker failed".to_string(),
        )
    })?
    .map_err(|err| (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()))?;

    Ok(Json(report))
}

async fn history_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<RobotRecord>>, (StatusCode, String)> {
    let robots = state.robots.lock().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "robot store unavailable".to_string(),
        )
    })?;
    let mut records: Vec<RobotRecord> = robots.values().cloned().collect();
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(records))
}

async fn robot_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RobotRecord>, (StatusCode, String)> {
    let robots = state.robots.lock().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "robot store unavailable".to_string(),
        )
    })?;
    robots
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown robot id '{id}'")))
}

async fn delete_robot_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mut robots = state.robots.lock().map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "robot store unavailable".to_string(),
        )
    })?;
    if robots.remove(&id).is_some() {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("unknown robot id '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn test_config() -> PipelineConfig {
        PipelineConfig::default()
    }

    fn box_bot_json() -> String {
        serde_json::json!({
            "name": "crate",
            "links": [
                {
                    "name": "base",
                    "mass": 5.0,
                    "visual": {"shape": "box", "size": [0.4, 0.2, 0.4]},
                    "collision": {"shape": "box", "size": [0.4, 0.2, 0.4]}
                }
            ],
            "joints": []
        })
        .to_string()
    }

    fn rover_json() -> String {
        let mut links = vec![serde_json::json!({
            "name": "body",
            "mass": 8.0,
            "visual": {"shape": "box", "size": [0.6, 0.25, 0.4]},
            "collision": {"shape": "box", "size": [0.6, 0.25, 0.4]}
        })];
        let mut joints = Vec::new();
        for (index, (x, z)) in [(0.45, 0.35), (0.45, -0.35), (-0.45, 0.35), (-0.45, -0.35)]
            .into_iter()
            .enumerate()
        {
            links.push(serde_json::json!({
                "name": format!("wheel_{index}"),
                "mass": 1.2,
                "visual": {"shape": "sphere", "radius": 0.12},
                "collision": {"shape": "sphere", "radius": 0.12}
            }));
            joints.push(serde_json::json!({
                "name": format!("axle_{index}"),
                "jointType": "continuous",
                "parent": 0,
                "child": index + 1,
                "origin": [x, -0.25, z],
                "axis": [0.0, 0.0, 1.0],
                "limit": {"lower": 0.0, "upper": 0.0, "effort": 150.0, "velocity": 6.0}
            }));
        }
        serde_json::json!({ "name": "rover", "links": links, "joints": joints }).to_string()
    }

    fn settled_outcome(
        terrain: Terrain,
        displacement: f32,
        tilt_cos: f32,
        grounded_fraction: f32,
    ) -> SimulationOutcome {
        SimulationOutcome {
            terrain,
            duration_seconds: 5.0,
            motors_enabled: true,
            final_position: [displacement, 0.2, 0.0],
            final_rotation: [0.0, 0.0, 0.0, 1.0],
            tilt_cos,
            displacement,
            max_displacement: displacement,
            distance_from_origin: displacement,
            diverged: false,
            joint_names: Vec::new(),
            contact_links: vec!["base".to_string()],
            grounded_links: Vec::new(),
            grounded_fraction,
            trajectory: None,
            spawn_snapshot: Vec::new(),
            settled_snapshot: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    #[test]
    fn config_defaults_are_sane() {
        let config = test_config();
        assert_eq!(config.step_rate_hz, 240.0);
        assert_eq!(config.record_hz, 30.0);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.max_backend_failures, 3);
        assert!(config.sanity_horizon_seconds < config.horizon_seconds);
        assert!(config.sanity_divergence_distance < config.divergence_distance);
    }

    #[test]
    fn config_partial_override_keeps_other_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"maxAttempts": 2, "horizonSeconds": 1.0}"#).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.horizon_seconds, 1.0);
        assert_eq!(config.step_rate_hz, 240.0);
    }

    // ------------------------------------------------------------------
    // Parsing and validation
    // ------------------------------------------------------------------

    #[test]
    fn rover_passes_validation() {
        let result = validate_description(&rover_json(), &test_config());
        assert!(result.passed, "issues: {:?}", result.issues);
        let description = result.description.unwrap();
        assert_eq!(description.links.len(), 5);
        assert_eq!(description.contact_link_indices(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn parse_error_short_circuits() {
        let result = validate_description("this is not json", &test_config());
        assert!(!result.passed);
        assert_eq!(result.issues.len(), 1);
        assert!(result.has_issue(IssueCode::ParseError));
        assert!(result.description.is_none());
    }

    #[test]
    fn empty_links_rejected() {
        let raw = r#"{"name": "void", "links": [], "joints": []}"#;
        let result = validate_description(raw, &test_config());
        assert!(result.has_issue(IssueCode::ParseError));
    }

    #[test]
    fn validator_collects_multiple_issues() {
        let raw = serde_json::json!({
            "name": "broken",
            "links": [
                {"name": "base", "mass": 5.0,
                 "collision": {"shape": "box", "size": [0.4, 0.2, 0.4]}},
                {"name": "arm", "mass": 1.0,
                 "visual": {"shape": "box", "size": [0.1, 0.3, 0.1]}}
            ],
            "joints": [
                {"name": "shoulder", "jointType": "revolute", "parent": 0, "child": 1,
                 "origin": [0.0, 0.4, 0.0],
                 "limit": {"lower": -1.0, "upper": 1.0, "effort": 20.0, "velocity": 2.0}}
            ]
        })
        .to_string();
        let result = validate_description(&raw, &test_config());
        assert!(!result.passed);
        assert!(result.has_issue(IssueCode::MissingVisual));
        assert!(result.has_issue(IssueCode::MissingCollision));
        assert!(result.has_issue(IssueCode::LowEffort));
    }

    #[test]
    fn clearance_issue_names_both_links() {
        let raw = serde_json::json!({
            "name": "cramped",
            "links": [
                {"name": "hull", "mass": 5.0,
                 "visual": {"shape": "box", "size": [0.6, 0.25, 0.4]},
                 "collision": {"shape": "box", "size": [0.6, 0.25, 0.4]}},
                {"name": "fin", "mass": 0.5,
                 "visual": {"shape": "box", "size": [0.05, 0.2, 0.05]},
                 "collision": {"shape": "box", "size": [0.05, 0.2, 0.05]}}
            ],
            "joints": [
                {"name": "hinge", "jointType": "revolute", "parent": 0, "child": 1,
                 "origin": [0.1, 0.0, 0.0],
                 "limit": {"lower": -1.0, "upper": 1.0, "effort": 120.0, "velocity": 2.0}}
            ]
        })
        .to_string();
        let result = validate_description(&raw, &test_config());
        assert!(result.has_issue(IssueCode::InsufficientClearance));
        let issue = result
            .issues
            .iter()
            .find(|issue| issue.code == IssueCode::InsufficientClearance)
            .unwrap();
        assert!(issue.message.contains("fin"));
        assert!(issue.message.contains("hull"));
    }

    #[test]
    fn graph_rejects_backward_and_dangling_joints() {
        let raw = serde_json::json!({
            "name": "tangle",
            "links": [
                {"name": "a", "mass": 1.0,
                 "visual": {"shape": "sphere", "radius": 0.1},
                 "collision": {"shape": "sphere", "radius": 0.1}},
                {"name": "b", "mass": 1.0,
                 "visual": {"shape": "sphere", "radius": 0.1},
                 "collision": {"shape": "sphere", "radius": 0.1}},
                {"name": "c", "mass": 1.0,
                 "visual": {"shape": "sphere", "radius": 0.1},
                 "collision": {"shape": "sphere", "radius": 0.1}}
            ],
            "joints": [
                {"name": "backward", "jointType": "fixed", "parent": 1, "child": 0,
                 "origin": [0.5, 0.0, 0.0]},
                {"name": "dangling", "jointType": "fixed", "parent": 0, "child": 9,
                 "origin": [0.5, 0.0, 0.0]}
            ]
        })
        .to_string();
        let result = validate_description(&raw, &test_config());
        assert!(!result.passed);
        let graph_issues = result
            .issues
            .iter()
            .filter(|issue| issue.code == IssueCode::InvalidGraph)
            .count();
        // backward joint, out-of-range joint, plus b and c left unconnected
        assert!(graph_issues >= 3, "issues: {:?}", result.issues);
    }

    #[test]
    fn joint_limit_defaults_apply() {
        let raw = serde_json::json!({
            "name": "minimal",
            "links": [
                {"name": "a", "mass": 1.0,
                 "visual": {"shape": "sphere", "radius": 0.1},
                 "collision": {"shape": "sphere", "radius": 0.1}},
                {"name": "b", "mass": 1.0,
                 "visual": {"shape": "sphere", "radius": 0.1},
                 "collision": {"shape": "sphere", "radius": 0.1}}
            ],
            "joints": [
                {"name": "j", "jointType": "revolute", "parent": 0, "child": 1,
                 "origin": [0.5, 0.0, 0.0]}
            ]
        })
        .to_string();
        let description = parse_description(&raw).unwrap();
        let limit = &description.joints[0].limit;
        assert_eq!(limit.effort, 150.0);
        assert!(limit.lower < limit.upper);
    }

    // ------------------------------------------------------------------
    // Descriptor extraction
    // ------------------------------------------------------------------

    #[test]
    fn extraction_strips_fences_and_prose() {
        let reply = "Sure! Here is your robot:\n```json\n{\"name\": \"bot\"}\n```\nEnjoy.";
        assert_eq!(extract_description(reply).unwrap(), "{\"name\": \"bot\"}");
    }

    #[test]
    fn extraction_handles_nested_objects_and_braces_in_strings() {
        let reply = r#"prefix {"a": {"b": "close } brace"}, "c": 1} suffix"#;
        let extracted = extract_description(reply).unwrap();
        let value: serde_json::Value = serde_json::from_str(&extracted).unwrap();
        assert_eq!(value["c"], 1);
    }

    #[test]
    fn extraction_returns_none_without_object() {
        assert!(extract_description("no json here at all").is_none());
        assert!(extract_description("{ truncated").is_none());
    }

    // ------------------------------------------------------------------
    // Scoring (ported behavior checks)
    // ------------------------------------------------------------------

    #[test]
    fn standing_still_scores_perfect_on_flat() {
        let outcome = settled_outcome(Terrain::Flat, 0.0, 1.0, 1.0);
        let score = compute_score(&outcome);
        assert_eq!(score.stability, 100.0);
        assert_eq!(score.uprightness, 100.0);
        assert_eq!(score.grounding, 100.0);
        assert_eq!(score.total, 100.0);
        assert_eq!(score.label, "Excellent");
    }

    #[test]
    fn diverged_run_scores_zero() {
        let mut outcome = settled_outcome(Terrain::Flat, 2.0, 1.0, 1.0);
        outcome.diverged = true;
        let score = compute_score(&outcome);
        assert_eq!(score.stability, 0.0);
        assert_eq!(score.uprightness, 0.0);
        assert_eq!(score.grounding, 0.0);
        assert_eq!(score.total, 0.0);
        assert_eq!(score.label, "Unstable");
    }

    #[test]
    fn drift_monotonically_lowers_stability() {
        let near = score_stability(&settled_outcome(Terrain::Flat, 0.5, 1.0, 1.0));
        let mid = score_stability(&settled_outcome(Terrain::Flat, 3.0, 1.0, 1.0));
        let far = score_stability(&settled_outcome(Terrain::Flat, 9.0, 1.0, 1.0));
        assert!(near > mid && mid > far);
        // drift beyond the scored window saturates
        let capped = score_stability(&settled_outcome(Terrain::Flat, 25.0, 1.0, 1.0));
        let at_cap = score_stability(&settled_outcome(Terrain::Flat, 10.0, 1.0, 1.0));
        assert!((capped - at_cap).abs() < 1e-3);

        // the composite total inherits the monotonicity
        let near_total = compute_score(&settled_outcome(Terrain::Flat, 0.5, 0.9, 0.75)).total;
        let far_total = compute_score(&settled_outcome(Terrain::Flat, 9.0, 0.9, 0.75)).total;
        assert!(near_total > far_total);
    }

    #[test]
    fn upside_down_uprightness_clamps_to_zero() {
        let outcome = settled_outcome(Terrain::Flat, 0.0, -0.8, 1.0);
        assert_eq!(score_uprightness(&outcome), 0.0);
    }

    #[test]
    fn harder_terrain_multiplies_but_total_stays_clamped() {
        let flat = compute_score(&settled_outcome(Terrain::Flat, 1.5, 0.9, 0.75));
        let uneven = compute_score(&settled_outcome(Terrain::Uneven, 1.5, 0.9, 0.75));
        assert!(uneven.total > flat.total);

        let perfect_uneven = compute_score(&settled_outcome(Terrain::Uneven, 0.0, 1.0, 1.0));
        assert_eq!(perfect_uneven.total, 100.0);
    }

    #[test]
    fn score_labels_follow_thresholds() {
        assert_eq!(score_label(95.0), "Excellent");
        assert_eq!(score_label(90.0), "Excellent");
        assert_eq!(score_label(75.0), "Great");
        assert_eq!(score_label(60.0), "Good");
        assert_eq!(score_label(40.0), "Fair");
        assert_eq!(score_label(20.0), "Poor");
        assert_eq!(score_label(19.9), "Unstable");
    }

    // ------------------------------------------------------------------
    // Terrain and stress aggregation
    // ------------------------------------------------------------------

    #[test]
    fn terrain_order_and_multipliers_are_fixed() {
        assert_eq!(
            Terrain::ALL,
            [Terrain::Flat, Terrain::Uneven, Terrain::Stairs, Terrain::Slope]
        );
        assert_eq!(Terrain::Flat.multiplier(), 1.0);
        assert!(Terrain::Slope.multiplier() < Terrain::Stairs.multiplier());
        assert!(Terrain::Stairs.multiplier() < Terrain::Uneven.multiplier());
    }

    #[test]
    fn stress_summary_counts_partial_failures() {
        let score = compute_score(&settled_outcome(Terrain::Flat, 0.0, 1.0, 1.0));
        let mut diverged_on_stairs = settled_outcome(Terrain::Stairs, 2.0, 1.0, 1.0);
        diverged_on_stairs.diverged = true;
        let runs = vec![
            TerrainRun {
                terrain: Terrain::Flat,
                completed: true,
                error: None,
                score: Some(score.clone()),
            },
            TerrainRun {
                terrain: Terrain::Uneven,
                completed: true,
                error: None,
                score: Some(score.clone()),
            },
            // a diverged run keeps its zeroed score but is not a pass
            TerrainRun {
                terrain: Terrain::Stairs,
                completed: false,
                error: Some("simulation diverged".to_string()),
                score: Some(compute_score(&diverged_on_stairs)),
            },
            TerrainRun {
                terrain: Terrain::Slope,
                completed: true,
                error: None,
                score: Some(score),
            },
        ];
        let summary = summarize_stress(&runs);
        assert_eq!(summary.terrains_passed, 3);
        assert_eq!(summary.terrains_total, 4);
        assert_eq!(summary.average_score, 100.0);
        assert_ne!(summary.worst_terrain, Some(Terrain::Stairs));
    }

    #[test]
    fn diverged_terrain_counts_as_failed() {
        let description = parse_description(&box_bot_json()).unwrap();
        let mut config = test_config();
        config.horizon_seconds = 1.0;
        // spawn clearance alone exceeds this, so every terrain diverges
        config.divergence_distance = 0.2;
        let cancel = AtomicBool::new(false);
        let report = stress_test(&description, &config, &cancel).unwrap();
        assert_eq!(report.runs.len(), 4);
        for run in &report.runs {
            assert!(!run.completed);
            assert_eq!(run.error.as_deref(), Some("simulation diverged"));
            assert_eq!(run.score.as_ref().unwrap().total, 0.0);
        }
        assert_eq!(report.summary.terrains_passed, 0);
        assert_eq!(report.summary.terrains_total, 4);
        assert_eq!(report.summary.average_score, 0.0);
    }

    // ------------------------------------------------------------------
    // Sanity checker
    // ------------------------------------------------------------------

    fn snapshot(name: &str, position: [f32; 3], half_extents: [f32; 3]) -> LinkSnapshot {
        LinkSnapshot {
            name: name.to_string(),
            position,
            rotation: [0.0, 0.0, 0.0, 1.0],
            half_extents,
        }
    }

    #[test]
    fn sanity_flags_overlapping_non_adjacent_links() {
        let description = parse_description(&rover_json()).unwrap();
        let mut outcome = settled_outcome(Terrain::Flat, 0.0, 1.0, 1.0);
        // wheels 1 and 2 share an index pair with no joint between them
        outcome.spawn_snapshot = vec![
            snapshot("body", [0.0, 1.0, 0.0], [0.3, 0.125, 0.2]),
            snapshot("wheel_0", [0.5, 0.75, 0.0], [0.12, 0.12, 0.12]),
            snapshot("wheel_1", [0.5, 0.75, 0.05], [0.12, 0.12, 0.12]),
            snapshot("wheel_2", [-0.5, 0.75, 0.35], [0.12, 0.12, 0.12]),
            snapshot("wheel_3", [-0.5, 0.75, -0.35], [0.12, 0.12, 0.12]),
        ];
        outcome.settled_snapshot = outcome.spawn_snapshot.clone();
        let report = check_sanity(&description, &outcome);
        assert!(!report.passed);
        assert!(
            report
                .spawn_self_collisions
                .contains(&["wheel_0".to_string(), "wheel_1".to_string()])
        );
    }

    #[test]
    fn sanity_skips_joint_adjacent_pairs() {
        let description = parse_description(&rover_json()).unwrap();
        let mut outcome = settled_outcome(Terrain::Flat, 0.0, 1.0, 1.0);
        // wheel_0 overlaps the body it is jointed to; that is fine
        outcome.spawn_snapshot = vec![
            snapshot("body", [0.0, 1.0, 0.0], [0.3, 0.125, 0.2]),
            snapshot("wheel_0", [0.25, 1.0, 0.1], [0.12, 0.12, 0.12]),
            snapshot("wheel_1", [0.45, 0.75, -0.35], [0.12, 0.12, 0.12]),
            snapshot("wheel_2", [-0.45, 0.75, 0.35], [0.12, 0.12, 0.12]),
            snapshot("wheel_3", [-0.45, 0.75, -0.35], [0.12, 0.12, 0.12]),
        ];
        outcome.settled_snapshot = outcome.spawn_snapshot.clone();
        let report = check_sanity(&description, &outcome);
        assert!(report.passed, "issues: {:?}", report.issues);
    }

    #[test]
    fn sanity_fails_on_divergence_and_tipping() {
        let description = parse_description(&box_bot_json()).unwrap();
        let mut outcome = settled_outcome(Terrain::Flat, 0.0, 0.05, 1.0);
        outcome.diverged = true;
        let report = check_sanity(&description, &outcome);
        assert!(!report.passed);
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn rotated_box_aabb_swaps_extents() {
        let rotation = UnitQuaternion::from_axis_angle(
            &Vector3::y_axis(),
            std::f32::consts::FRAC_PI_2,
        );
        let extents = world_aabb_extents(&rotation, &[0.3, 0.1, 0.05]);
        assert!((extents.x - 0.05).abs() < 1e-4);
        assert!((extents.y - 0.1).abs() < 1e-4);
        assert!((extents.z - 0.3).abs() < 1e-4);
    }

    // ------------------------------------------------------------------
    // Physics harness
    // ------------------------------------------------------------------

    #[test]
    fn box_settles_on_flat_ground() {
        let description = parse_description(&box_bot_json()).unwrap();
        let mut config = test_config();
        config.horizon_seconds = 2.0;
        let options = SimOptions::scoring(&config, Terrain::Flat, false, true);
        let cancel = AtomicBool::new(false);
        let outcome = simulate(&description, &options, &config, &cancel).unwrap();

        assert!(!outcome.diverged);
        assert!(outcome.tilt_cos > 0.9, "tilt_cos = {}", outcome.tilt_cos);
        assert!(outcome.displacement < 0.5);
        assert_eq!(outcome.grounded_fraction, 1.0);

        let trajectory = outcome.trajectory.unwrap();
        assert_eq!(trajectory.frame_count, 60);
        assert_eq!(trajectory.frames.len(), 60);
        for pair in trajectory.frames.windows(2) {
            assert!(pair[1].t > pair[0].t);
        }
    }

    #[test]
    fn implausible_mass_is_a_backend_load_error() {
        let mut description = parse_description(&box_bot_json()).unwrap();
        description.links[0].mass = f32::NAN;
        let config = test_config();
        let options = SimOptions::sanity(&config);
        let cancel = AtomicBool::new(false);
        let err = simulate(&description, &options, &config, &cancel).unwrap_err();
        assert!(matches!(err, SimError::BackendLoad(_)));
    }

    #[test]
    fn cancellation_stops_the_run() {
        let description = parse_description(&box_bot_json()).unwrap();
        let config = test_config();
        let options = SimOptions::scoring(&config, Terrain::Flat, false, false);
        let cancel = AtomicBool::new(true);
        let err = simulate(&description, &options, &config, &cancel).unwrap_err();
        assert!(matches!(err, SimError::Cancelled));
    }

    #[test]
    fn stress_reports_every_terrain() {
        let description = parse_description(&box_bot_json()).unwrap();
        let mut config = test_config();
        config.horizon_seconds = 1.0;
        let cancel = AtomicBool::new(false);
        let report = stress_test(&description, &config, &cancel).unwrap();
        assert_eq!(report.runs.len(), 4);
        let terrains: Vec<Terrain> = report.runs.iter().map(|run| run.terrain).collect();
        assert_eq!(terrains, Terrain::ALL.to_vec());
        assert_eq!(report.summary.terrains_total, 4);
    }

    // ------------------------------------------------------------------
    // Repair orchestrator
    // ------------------------------------------------------------------

    struct ScriptedProducer {
        replies: Mutex<VecDeque<Result<String, ProducerError>>>,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedProducer {
        fn new(replies: Vec<Result<String, ProducerError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn recorded_calls(&self) -> Vec<Option<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DescriptorProducer for ScriptedProducer {
        fn produce(&self, _prompt: &str, feedback: Option<&str>) -> Result<String, ProducerError> {
            self.calls
                .lock()
                .unwrap()
                .push(feedback.map(str::to_string));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("{}".to_string()))
        }
    }

    fn missing_collision_json() -> String {
        serde_json::json!({
            "name": "crate",
            "links": [
                {"name": "base", "mass": 5.0,
                 "visual": {"shape": "box", "size": [0.4, 0.2, 0.4]}}
            ],
            "joints": []
        })
        .to_string()
    }

    #[test]
    fn orchestrator_accepts_after_validation_feedback() {
        let producer =
            ScriptedProducer::new(vec![Ok(missing_collision_json()), Ok(box_bot_json())]);
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let outcome = RepairOrchestrator::new(&producer, &config)
            .orchestrate("a sturdy crate robot", &cancel)
            .unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.attempts_used, 2);
        assert!(outcome.score.is_some());
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.history[0].failure, FailureKind::Validation);
        assert!(outcome.history[0].feedback.contains("MISSING_COLLISION"));

        let calls = producer.recorded_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].is_none());
        assert!(calls[1].as_ref().unwrap().contains("MISSING_COLLISION"));
    }

    #[test]
    fn orchestrator_exhausts_attempt_budget() {
        let producer = ScriptedProducer::new(Vec::new()); // always replies "{}"
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let outcome = RepairOrchestrator::new(&producer, &config)
            .orchestrate("anything", &cancel)
            .unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.attempts_used, config.max_attempts);
        assert_eq!(outcome.history.len(), config.max_attempts);
        assert!(
            outcome
                .history
                .iter()
                .all(|attempt| attempt.failure == FailureKind::Validation)
        );
    }

    #[test]
    fn consecutive_transport_failures_escalate() {
        let producer = ScriptedProducer::new(vec![
            Err(ProducerError::Request("connection refused".to_string())),
            Err(ProducerError::Timeout),
            Err(ProducerError::Request("connection refused".to_string())),
        ]);
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let err = RepairOrchestrator::new(&producer, &config)
            .orchestrate("anything", &cancel)
            .unwrap_err();
        match err {
            SessionError::BackendFailure { count, .. } => assert_eq!(count, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_reply_retries_without_escalating() {
        let producer = ScriptedProducer::new(vec![
            Err(ProducerError::Empty),
            Err(ProducerError::Empty),
            Err(ProducerError::Empty),
            Ok(box_bot_json()),
        ]);
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let outcome = RepairOrchestrator::new(&producer, &config)
            .orchestrate("anything", &cancel)
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.attempts_used, 4);
    }

    #[test]
    fn cancellation_aborts_the_session() {
        let producer = ScriptedProducer::new(Vec::new());
        let config = test_config();
        let cancel = AtomicBool::new(true);
        let err = RepairOrchestrator::new(&producer, &config)
            .orchestrate("anything", &cancel)
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }

    #[test]
    fn limb_prompt_gets_decomposition_hint_on_first_attempt() {
        let producer = ScriptedProducer::new(vec![Ok(box_bot_json())]);
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let outcome = RepairOrchestrator::new(&producer, &config)
            .orchestrate("a quadruped walker for rough ground", &cancel)
            .unwrap();
        assert!(outcome.accepted);

        let calls = producer.recorded_calls();
        let hint = calls[0].as_ref().expect("first call should carry the hint");
        assert!(hint.contains("4 limbs"));
        assert!(hint.contains("limb 4:"));
    }

    #[test]
    fn limb_counts_detected_from_prompt_wording() {
        assert_eq!(detect_limb_count("a hexapod scout"), Some(6));
        assert_eq!(detect_limb_count("build me a Quadruped"), Some(4));
        assert_eq!(detect_limb_count("robot with four legs"), Some(4));
        assert_eq!(detect_limb_count("a 6 legged strider"), Some(6));
        assert_eq!(detect_limb_count("a wheeled rover"), None);
    }
}
