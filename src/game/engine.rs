//! Physics engine capability driven by the world runner
//!
//! The runner only needs a handful of operations from an engine: create bodies
//! and fixtures, move a body, step the world and read poses back, plus a
//! begin-contact callback. [`PhysicsWorld`] captures that surface.
//!
//! [`SimpleWorld`] is the built-in engine. It integrates gravity on dynamic
//! bodies, moves kinematic bodies by their velocity and reports begin-contact
//! for fixtures whose bounding boxes start to overlap. Collision response and
//! constraint solving are not modelled.

use std::collections::HashSet;

use glam::Vec2;

use super::body::BodyKind;

/// Category assigned to fixtures that carry no key-body tag
pub const DEFAULT_CATEGORY: u16 = 0x0001;

/// Handle of a body inside one physics world
pub type BodyHandle = usize;

/// Collision filter data of a fixture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub category_bits: u16,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            category_bits: DEFAULT_CATEGORY,
        }
    }
}

/// Geometry of a fixture in body-local coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixtureShape {
    Box {
        half_extents: Vec2,
        center: Vec2,
        angle: f32,
    },
    Circle {
        radius: f32,
        center: Vec2,
    },
}

impl FixtureShape {
    pub fn boxed(half_width: f32, half_height: f32) -> Self {
        Self::Box {
            half_extents: Vec2::new(half_width, half_height),
            center: Vec2::ZERO,
            angle: 0.0,
        }
    }

    pub fn boxed_at(half_width: f32, half_height: f32, center: Vec2) -> Self {
        Self::Box {
            half_extents: Vec2::new(half_width, half_height),
            center,
            angle: 0.0,
        }
    }

    /// World-space bounding box for a body at `position` rotated by `angle`
    fn aabb(&self, position: Vec2, angle: f32) -> Aabb {
        let rotation = Vec2::from_angle(angle);
        match *self {
            FixtureShape::Box {
                half_extents,
                center,
                angle: local_angle,
            } => {
                let (sin, cos) = (angle + local_angle).sin_cos();
                let extents = Vec2::new(
                    cos.abs() * half_extents.x + sin.abs() * half_extents.y,
                    sin.abs() * half_extents.x + cos.abs() * half_extents.y,
                );
                let center = position + rotation.rotate(center);
                Aabb {
                    min: center - extents,
                    max: center + extents,
                }
            }
            FixtureShape::Circle { radius, center } => {
                let center = position + rotation.rotate(center);
                Aabb {
                    min: center - Vec2::splat(radius),
                    max: center + Vec2::splat(radius),
                }
            }
        }
    }
}

/// Fixture description attached to a body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixtureDef {
    pub shape: FixtureShape,
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
    pub is_sensor: bool,
    pub filter: Filter,
}

impl FixtureDef {
    pub fn new(shape: FixtureShape) -> Self {
        Self {
            shape,
            density: 0.0,
            friction: 0.2,
            restitution: 0.0,
            is_sensor: false,
            filter: Filter::default(),
        }
    }
}

/// Body placement in engine coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyDef {
    pub kind: BodyKind,
    pub position: Vec2,
    pub angle: f32,
}

/// Fixture as seen by a contact callback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactFixture {
    pub body: BodyHandle,
    pub filter: Filter,
    pub is_sensor: bool,
}

/// Callback surface from the engine into its owner
pub trait ContactListener: Send {
    fn begin_contact(&self, a: &ContactFixture, b: &ContactFixture);
}

/// Operations the world runner drives on an engine
pub trait PhysicsWorld: Send {
    fn create_body(&mut self, def: &BodyDef) -> BodyHandle;

    fn create_fixture(&mut self, body: BodyHandle, def: FixtureDef);

    fn fixtures(&self, body: BodyHandle) -> &[FixtureDef];

    fn set_transform(&mut self, body: BodyHandle, position: Vec2, angle: f32);

    fn set_contact_listener(&mut self, listener: Box<dyn ContactListener>);

    fn step(&mut self, dt: f32, velocity_iterations: u32, position_iterations: u32);

    fn position(&self, body: BodyHandle) -> Vec2;

    fn linear_velocity(&self, body: BodyHandle) -> Vec2;

    fn angle(&self, body: BodyHandle) -> f32;

    fn body_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min: Vec2,
    max: Vec2,
}

impl Aabb {
    fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
    }
}

#[derive(Debug)]
struct SimpleBody {
    kind: BodyKind,
    position: Vec2,
    angle: f32,
    velocity: Vec2,
    fixtures: Vec<FixtureDef>,
}

/// (body, fixture index)
type FixtureKey = (BodyHandle, usize);

/// Minimal gravity-integrating engine with bounding-box contact detection
pub struct SimpleWorld {
    gravity: Vec2,
    bodies: Vec<SimpleBody>,
    listener: Option<Box<dyn ContactListener>>,
    touching: HashSet<(FixtureKey, FixtureKey)>,
}

impl SimpleWorld {
    pub fn new(gravity: Vec2) -> Self {
        Self {
            gravity,
            bodies: Vec::new(),
            listener: None,
            touching: HashSet::new(),
        }
    }

    pub fn set_linear_velocity(&mut self, body: BodyHandle, velocity: Vec2) {
        if let Some(body) = self.bodies.get_mut(body) {
            body.velocity = velocity;
        }
    }

    fn integrate(&mut self, dt: f32) {
        for body in &mut self.bodies {
            match body.kind {
                BodyKind::Dynamic => {
                    body.velocity += self.gravity * dt;
                    body.position += body.velocity * dt;
                }
                BodyKind::Kinematic => {
                    body.position += body.velocity * dt;
                }
                BodyKind::Static => {}
            }
        }
    }

    fn detect_contacts(&mut self) {
        let mut proxies = Vec::new();
        for (handle, body) in self.bodies.iter().enumerate() {
            for (index, fixture) in body.fixtures.iter().enumerate() {
                proxies.push((
                    (handle, index),
                    fixture.shape.aabb(body.position, body.angle),
                    ContactFixture {
                        body: handle,
                        filter: fixture.filter,
                        is_sensor: fixture.is_sensor,
                    },
                ));
            }
        }

        let mut current = HashSet::new();
        for (i, (key_a, aabb_a, fixture_a)) in proxies.iter().enumerate() {
            for (key_b, aabb_b, fixture_b) in &proxies[i + 1..] {
                if key_a.0 == key_b.0 {
                    continue;
                }
                let both_static = self.bodies[key_a.0].kind == BodyKind::Static
                    && self.bodies[key_b.0].kind == BodyKind::Static;
                if both_static || !aabb_a.overlaps(aabb_b) {
                    continue;
                }

                let pair = (*key_a, *key_b);
                if !self.touching.contains(&pair) {
                    if let Some(listener) = &self.listener {
                        listener.begin_contact(fixture_a, fixture_b);
                    }
                }
                current.insert(pair);
            }
        }

        self.touching = current;
    }
}

impl PhysicsWorld for SimpleWorld {
    fn create_body(&mut self, def: &BodyDef) -> BodyHandle {
        self.bodies.push(SimpleBody {
            kind: def.kind,
            position: def.position,
            angle: def.angle,
            velocity: Vec2::ZERO,
            fixtures: Vec::new(),
        });
        self.bodies.len() - 1
    }

    fn create_fixture(&mut self, body: BodyHandle, def: FixtureDef) {
        if let Some(body) = self.bodies.get_mut(body) {
            body.fixtures.push(def);
        }
    }

    fn fixtures(&self, body: BodyHandle) -> &[FixtureDef] {
        self.bodies
            .get(body)
            .map(|b| b.fixtures.as_slice())
            .unwrap_or(&[])
    }

    fn set_transform(&mut self, body: BodyHandle, position: Vec2, angle: f32) {
        if let Some(body) = self.bodies.get_mut(body) {
            body.position = position;
            body.angle = angle;
        }
    }

    fn set_contact_listener(&mut self, listener: Box<dyn ContactListener>) {
        self.listener = Some(listener);
    }

    fn step(&mut self, dt: f32, _velocity_iterations: u32, _position_iterations: u32) {
        self.integrate(dt);
        self.detect_contacts();
    }

    fn position(&self, body: BodyHandle) -> Vec2 {
        self.bodies.get(body).map(|b| b.position).unwrap_or(Vec2::ZERO)
    }

    fn linear_velocity(&self, body: BodyHandle) -> Vec2 {
        self.bodies.get(body).map(|b| b.velocity).unwrap_or(Vec2::ZERO)
    }

    fn angle(&self, body: BodyHandle) -> f32 {
        self.bodies.get(body).map(|b| b.angle).unwrap_or(0.0)
    }

    fn body_count(&self) -> usize {
        self.bodies.len()
    }
}
