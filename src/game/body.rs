//! Board geometry declarations and per-tick body poses
//!
//! Declarations follow the board schema, which uses a flipped vertical axis:
//! `y` grows downwards and angles turn clockwise. The world runner negates
//! both when handing bodies to the physics engine.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use super::engine::DEFAULT_CATEGORY;
use super::world::WorldError;

/// Identifier of a body inside one board definition
pub type BodyId = u64;

/// Pose of one dynamic body at one simulated tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyFrame {
    pub position: Vec2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Vec2>,
    pub angle: f32,
}

/// Pose a player assigned to a body while planning, in board coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveFrame {
    pub body_id: BodyId,
    pub position: Vec2,
    #[serde(default)]
    pub angle: f32,
}

/// How the engine treats a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    Static,
    Kinematic,
    Dynamic,
}

/// Textual shape discriminator of the board schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rect,
    Circle,
    Bucket,
}

/// Dimensions of the open-topped bucket composite
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub wall_thickness: f32,
    pub bottom_length: f32,
    pub height: f32,
}

/// Physical options shared by every fixture of a body
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyOptions {
    #[serde(default)]
    pub sensor: bool,
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
    /// Collision category used when the body is a key body
    #[serde(default)]
    pub key_body_id: Option<u16>,
}

impl Default for BodyOptions {
    fn default() -> Self {
        Self {
            sensor: false,
            density: 1.0,
            friction: 0.2,
            restitution: 0.0,
            key_body_id: None,
        }
    }
}

/// Placement and shape payload of a body declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyData {
    pub position: Vec2,
    #[serde(default)]
    pub angle: f32,
    #[serde(default)]
    pub size: Option<Vec2>,
    #[serde(default)]
    pub radius: Option<f32>,
    #[serde(default)]
    pub config: Option<BucketConfig>,
    #[serde(default)]
    pub options: BodyOptions,
}

/// One body of a board definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyDecl {
    pub id: BodyId,
    pub body_type: BodyKind,
    pub shape: ShapeKind,
    #[serde(default)]
    pub key_body: bool,
    pub data: BodyData,
}

/// Joint declaration, carried through untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointDecl(pub serde_json::Value);

/// Full geometry of a board
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardGeometry {
    pub bodies: Vec<BodyDecl>,
    #[serde(default)]
    pub joints: Vec<JointDecl>,
}

/// Validated shape payload, one variant per supported body type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Rect { size: Vec2 },
    Circle { radius: f32 },
    Bucket(BucketConfig),
}

impl BodyDecl {
    /// Resolve the shape payload required by the declared shape kind
    pub fn shape(&self) -> Result<Shape, WorldError> {
        match self.shape {
            ShapeKind::Rect => self
                .data
                .size
                .map(|size| Shape::Rect { size })
                .ok_or(WorldError::MissingSize(self.id)),
            ShapeKind::Circle => self
                .data
                .radius
                .map(|radius| Shape::Circle { radius })
                .ok_or(WorldError::MissingRadius(self.id)),
            ShapeKind::Bucket => self
                .data
                .config
                .map(Shape::Bucket)
                .ok_or(WorldError::MissingBucketConfig(self.id)),
        }
    }

    /// Collision category of the body's tagged fixtures
    pub fn category_bits(&self) -> u16 {
        match self.data.options.key_body_id {
            Some(category) if self.key_body => category,
            _ => DEFAULT_CATEGORY,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.body_type == BodyKind::Dynamic
    }
}

/// Convert a schema-space pose into engine space
pub fn to_engine(position: Vec2, angle: f32) -> (Vec2, f32) {
    (Vec2::new(position.x, -position.y), -angle)
}
