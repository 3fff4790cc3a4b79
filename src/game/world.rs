//! World runner: one physics world per session and its fixed-tick loop

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use glam::Vec2;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::SimulationSettings;

use super::body::{to_engine, BodyDecl, BodyFrame, BodyId, BucketConfig, JointDecl, MoveFrame, Shape};
use super::engine::{
    BodyDef, BodyHandle, FixtureDef, FixtureShape, PhysicsWorld, SimpleWorld, DEFAULT_CATEGORY,
};
use super::listener::TerminalContactListener;
use super::{BoardId, SessionId};

/// World construction and hand-off failures
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("body {0} is a rect without a size")]
    MissingSize(BodyId),

    #[error("body {0} is a circle without a radius")]
    MissingRadius(BodyId),

    #[error("body {0} is a bucket without a compound config")]
    MissingBucketConfig(BodyId),

    #[error("board {0} has no geometry")]
    UnknownBoard(BoardId),

    #[error("session {0} already has a running world")]
    AlreadyRunning(SessionId),

    #[error("failed to spawn world thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How a simulation loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Two terminal fixtures touched
    TerminalContact { ticks: u64 },
    /// The overall timeout elapsed first
    TimedOut { ticks: u64 },
    /// The registry discarded the session while it was running
    Discarded { ticks: u64 },
}

impl RunOutcome {
    pub fn ticks(&self) -> u64 {
        match *self {
            RunOutcome::TerminalContact { ticks }
            | RunOutcome::TimedOut { ticks }
            | RunOutcome::Discarded { ticks } => ticks,
        }
    }
}

/// Returned by [`Clock::sleep`] when the thread woke up early
#[derive(Debug, thiserror::Error)]
#[error("sleep interrupted after {slept:?} of {requested:?}")]
pub struct SleepInterrupted {
    pub requested: Duration,
    pub slept: Duration,
}

/// Time source of the tick loop
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted>;
}

/// Wall clock; sleeps park the thread so a discard can wake it
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        if duration.is_zero() {
            return Ok(());
        }
        let started = Instant::now();
        thread::park_timeout(duration);
        let slept = started.elapsed();
        if slept < duration {
            return Err(SleepInterrupted {
                requested: duration,
                slept,
            });
        }
        Ok(())
    }
}

/// Receives every tick's body frames as soon as they are recorded
pub trait FrameSink: Send + Sync {
    fn publish(&self, session_id: SessionId, tick: u64, bodies: &[(BodyId, BodyFrame)]);
}

/// Append-only per-body, per-tick frame diffs.
///
/// Written only by the owning runner; readers get clones of committed entries.
#[derive(Clone, Default)]
pub struct FrameLog {
    inner: Arc<RwLock<BTreeMap<BodyId, BTreeMap<u64, BodyFrame>>>>,
}

impl FrameLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, body: BodyId) {
        self.inner.write().entry(body).or_default();
    }

    /// Record the frame of `body` at `tick` unless one already exists.
    /// Returns whether a new frame was stored.
    pub fn record<F>(&self, body: BodyId, tick: u64, capture: F) -> bool
    where
        F: FnOnce() -> BodyFrame,
    {
        let mut inner = self.inner.write();
        let frames = inner.entry(body).or_default();
        if frames.contains_key(&tick) {
            return false;
        }
        frames.insert(tick, capture());
        true
    }

    pub fn frame(&self, body: BodyId, tick: u64) -> Option<BodyFrame> {
        self.inner.read().get(&body).and_then(|f| f.get(&tick).copied())
    }

    pub fn frames_for(&self, body: BodyId) -> Vec<(u64, BodyFrame)> {
        self.inner
            .read()
            .get(&body)
            .map(|f| f.iter().map(|(tick, frame)| (*tick, *frame)).collect())
            .unwrap_or_default()
    }

    pub fn tick_count(&self, body: BodyId) -> usize {
        self.inner.read().get(&body).map_or(0, BTreeMap::len)
    }

    /// Every body's frame at one tick
    pub fn at_tick(&self, tick: u64) -> Vec<(BodyId, BodyFrame)> {
        self.inner
            .read()
            .iter()
            .filter_map(|(body, frames)| frames.get(&tick).map(|f| (*body, *f)))
            .collect()
    }

    pub fn bodies(&self) -> Vec<BodyId> {
        self.inner.read().keys().copied().collect()
    }
}

/// Flags shared between a runner, its contact listener and the registry
#[derive(Clone)]
pub struct RunSignals {
    running: Arc<AtomicBool>,
    discarded: Arc<AtomicBool>,
}

impl RunSignals {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            discarded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the loop to stop at the next iteration boundary
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop and mark the world for release
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
        self.stop();
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }
}

/// Simulates one session's physics world
pub struct WorldRunner {
    session_id: SessionId,
    settings: SimulationSettings,
    world: Box<dyn PhysicsWorld>,
    clock: Arc<dyn Clock>,
    bodies: HashMap<BodyId, BodyHandle>,
    dynamic_bodies: BTreeMap<BodyId, BodyHandle>,
    frames: FrameLog,
    signals: RunSignals,
    sink: Option<Arc<dyn FrameSink>>,
}

impl WorldRunner {
    /// Runner backed by the built-in engine and the wall clock
    pub fn new(session_id: SessionId, settings: SimulationSettings) -> Self {
        let world = SimpleWorld::new(Vec2::new(0.0, settings.gravity));
        Self::with_parts(
            session_id,
            settings,
            Box::new(world),
            Arc::new(SystemClock::new()),
        )
    }

    pub fn with_parts(
        session_id: SessionId,
        settings: SimulationSettings,
        world: Box<dyn PhysicsWorld>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session_id,
            settings,
            world,
            clock,
            bodies: HashMap::new(),
            dynamic_bodies: BTreeMap::new(),
            frames: FrameLog::new(),
            signals: RunSignals::new(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn frames(&self) -> FrameLog {
        self.frames.clone()
    }

    pub fn signals(&self) -> RunSignals {
        self.signals.clone()
    }

    pub fn dynamic_body_ids(&self) -> Vec<BodyId> {
        self.dynamic_bodies.keys().copied().collect()
    }

    /// Build engine bodies and fixtures for every declaration.
    ///
    /// All shapes are validated before the first body is created, so a
    /// configuration error leaves the world empty.
    pub fn init_world(&mut self, bodies: &[BodyDecl], joints: &[JointDecl]) -> Result<(), WorldError> {
        info!(session_id = %self.session_id, bodies = bodies.len(), "World initialization started");

        let shapes = bodies
            .iter()
            .map(BodyDecl::shape)
            .collect::<Result<Vec<_>, _>>()?;

        for (decl, shape) in bodies.iter().zip(shapes) {
            let (position, angle) = to_engine(decl.data.position, decl.data.angle);
            let handle = self.world.create_body(&BodyDef {
                kind: decl.body_type,
                position,
                angle,
            });
            self.bodies.insert(decl.id, handle);
            if decl.is_dynamic() {
                self.dynamic_bodies.insert(decl.id, handle);
                self.frames.track(decl.id);
            }

            let options = decl.data.options;
            let category_bits = decl.category_bits();
            let is_bucket = matches!(shape, Shape::Bucket(_));
            for mut fixture in fixtures_for(shape, options.sensor) {
                fixture.density = options.density;
                fixture.friction = options.friction;
                fixture.restitution = options.restitution;
                if is_bucket {
                    fixture.filter.category_bits = if fixture.is_sensor {
                        category_bits
                    } else {
                        DEFAULT_CATEGORY
                    };
                } else {
                    fixture.is_sensor = options.sensor;
                    fixture.filter.category_bits = category_bits;
                }
                self.world.create_fixture(handle, fixture);
            }

            debug!(
                body_id = decl.id,
                kind = ?decl.body_type,
                shape = ?decl.shape,
                x = position.x,
                y = position.y,
                angle,
                category_bits,
                "Body created"
            );
        }

        self.world
            .set_contact_listener(Box::new(TerminalContactListener::new(self.signals.running.clone())));

        if !joints.is_empty() {
            debug!(joints = joints.len(), "Joint declarations passed through");
        }
        info!(
            session_id = %self.session_id,
            dynamic = self.dynamic_bodies.len(),
            "All bodies created"
        );
        Ok(())
    }

    /// Place bodies where players moved them. Returns how many moves applied.
    pub fn apply_moves(&mut self, moves: &[MoveFrame]) -> usize {
        let mut applied = 0;
        for frame in moves {
            match self.bodies.get(&frame.body_id) {
                Some(&handle) => {
                    let (position, angle) = to_engine(frame.position, frame.angle);
                    self.world.set_transform(handle, position, angle);
                    applied += 1;
                }
                None => warn!(body_id = frame.body_id, "Move targets unknown body"),
            }
        }
        applied
    }

    /// Capture every dynamic body's pose for `tick`, at most once per body
    pub fn record_tick(&self, tick: u64) -> usize {
        let mut recorded = 0;
        for (&body_id, &handle) in &self.dynamic_bodies {
            let world = &self.world;
            let inserted = self.frames.record(body_id, tick, || BodyFrame {
                position: world.position(handle),
                velocity: Some(world.linear_velocity(handle)),
                angle: world.angle(handle),
            });
            if inserted {
                recorded += 1;
            }
        }
        recorded
    }

    /// Fixed-tick loop. Returns when the running flag is cleared or the
    /// overall timeout elapses.
    pub fn run(&mut self) -> RunOutcome {
        let period = self.settings.tick_period();
        let dt = self.settings.tick_delta();
        let start = self.clock.now();
        let mut before = start;
        let mut tick: u64 = 0;
        let mut timed_out = false;

        info!(session_id = %self.session_id, "Start running");
        while self.signals.is_running() {
            if before.saturating_sub(start) >= self.settings.timeout {
                warn!(session_id = %self.session_id, ticks = tick, "Running timeout");
                timed_out = true;
                break;
            }

            tick += 1;
            trace!(tick, "Frame");
            self.record_tick(tick);
            self.world.step(
                dt,
                self.settings.velocity_iterations,
                self.settings.position_iterations,
            );
            if let Some(sink) = &self.sink {
                sink.publish(self.session_id, tick, &self.frames.at_tick(tick));
            }

            let after = self.clock.now();
            let sleep = period.saturating_sub(after.saturating_sub(before));
            if let Err(e) = self.clock.sleep(sleep) {
                warn!(session_id = %self.session_id, error = %e, "Sleep interrupted");
            }
            before = self.clock.now();
        }

        let outcome = if self.signals.is_discarded() {
            RunOutcome::Discarded { ticks: tick }
        } else if timed_out {
            RunOutcome::TimedOut { ticks: tick }
        } else {
            RunOutcome::TerminalContact { ticks: tick }
        };
        self.signals.stop();
        info!(session_id = %self.session_id, ?outcome, "Stop running");
        outcome
    }
}

/// Engine fixtures for a validated shape, before options are applied
fn fixtures_for(shape: Shape, sensor: bool) -> Vec<FixtureDef> {
    match shape {
        Shape::Rect { size } => rect_fixtures(size),
        Shape::Circle { radius } => circle_fixtures(radius),
        Shape::Bucket(config) => bucket_fixtures(config, sensor),
    }
}

fn rect_fixtures(size: Vec2) -> Vec<FixtureDef> {
    vec![FixtureDef::new(FixtureShape::boxed(size.x / 2.0, size.y / 2.0))]
}

fn circle_fixtures(radius: f32) -> Vec<FixtureDef> {
    vec![FixtureDef::new(FixtureShape::Circle {
        radius,
        center: Vec2::ZERO,
    })]
}

/// Two side walls, a floor and a sensor filling the inside
fn bucket_fixtures(config: BucketConfig, sensor: bool) -> Vec<FixtureDef> {
    let BucketConfig {
        wall_thickness: wall,
        bottom_length: bottom,
        height,
    } = config;
    let side_offset = (bottom + wall) / 2.0;

    let left = FixtureShape::boxed_at(wall / 2.0, height / 2.0, Vec2::new(-side_offset, 0.0));
    let right = FixtureShape::boxed_at(wall / 2.0, height / 2.0, Vec2::new(side_offset, 0.0));
    let floor = FixtureShape::boxed_at(
        bottom / 2.0,
        wall / 2.0,
        Vec2::new(0.0, -(height - wall) / 2.0),
    );
    let inside = FixtureShape::boxed_at(
        bottom / 2.0,
        (height - wall) / 2.0,
        Vec2::new(0.0, wall / 2.0),
    );

    let mut sensor_fixture = FixtureDef::new(inside);
    sensor_fixture.is_sensor = sensor;

    vec![
        FixtureDef::new(left),
        FixtureDef::new(right),
        FixtureDef::new(floor),
        sensor_fixture,
    ]
}
