//! Per-display calibration state
//!
//! A [`DisplayCalibration`] owns one display's control-point grid, its
//! per-eye warp meshes, blend fractions and placement offsets. It is mutated
//! only through replicated edit operations and persists write-through after
//! every mutation, so an unexpected process exit never loses more than the
//! in-flight nudge.

use nalgebra::{UnitQuaternion, Vector3};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::{BlendConfig, DisplayConfig, GridConfig};
use crate::mesh::{ControlPointGrid, WarpMesh};
use crate::store::{CalibrationStore, StoreError};

/// Which head camera an eye mesh warps for. At most one mesh exists per
/// role: stereo displays populate Left and Right, mono displays Center.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
    Center,
}

impl Eye {
    fn slot(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
            Eye::Center => 2,
        }
    }
}

/// Fixed three-slot map keyed by [`Eye`].
#[derive(Debug, Clone)]
pub struct EyeMap<T> {
    slots: [Option<T>; 3],
}

impl<T> Default for EyeMap<T> {
    fn default() -> Self {
        Self {
            slots: [None, None, None],
        }
    }
}

impl<T> EyeMap<T> {
    pub fn insert(&mut self, eye: Eye, value: T) -> Option<T> {
        self.slots[eye.slot()].replace(value)
    }

    pub fn get(&self, eye: Eye) -> Option<&T> {
        self.slots[eye.slot()].as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<&T> {
        self.slots.iter().flatten().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Eye, &T)> {
        [Eye::Left, Eye::Right, Eye::Center]
            .into_iter()
            .filter_map(|eye| self.slots[eye.slot()].as_ref().map(|v| (eye, v)))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().flatten()
    }
}

/// The physical display surface, at the boundary with the render pipeline:
/// screen geometry, render resolution and eye layout. Discovery happens in
/// the shared cluster config, which stands in for the live enumeration.
#[derive(Debug, Clone)]
pub struct DisplaySurface {
    pub name: String,
    /// Physical size in meters, grown by the blend fractions at setup.
    pub width: f32,
    pub height: f32,
    pub resolution: [u32; 2],
    pub stereo: bool,
}

impl DisplaySurface {
    pub fn from_config(config: &DisplayConfig) -> Self {
        Self {
            name: config.name.clone(),
            width: config.width,
            height: config.height,
            resolution: config.resolution,
            stereo: config.stereo,
        }
    }

    /// Width over height of the render window; warp mesh x coordinates are
    /// scaled by this so the mesh matches the display's proportions.
    pub fn aspect_ratio(&self) -> f32 {
        self.resolution[0] as f32 / self.resolution[1] as f32
    }

    pub fn half_width(&self) -> f32 {
        self.width * 0.5
    }

    pub fn half_height(&self) -> f32 {
        self.height * 0.5
    }
}

/// One display's calibration record: everything that is persisted plus the
/// blend fractions and owning machine from the cluster config.
#[derive(Debug, Clone)]
pub struct CalibrationRecord {
    pub grid: ControlPointGrid,
    /// Local position offset of the display surface.
    pub position: Vector3<f32>,
    /// Local rotation, Euler degrees.
    pub rotation: Vector3<f32>,
    pub blend: BlendConfig,
    pub machine: String,
}

impl CalibrationRecord {
    pub fn orientation(&self) -> UnitQuaternion<f32> {
        UnitQuaternion::from_euler_angles(
            self.rotation.x.to_radians(),
            self.rotation.y.to_radians(),
            self.rotation.z.to_radians(),
        )
    }
}

/// One eye's warp mesh and where it sits in mesh space.
#[derive(Debug, Clone)]
pub struct EyeWarp {
    pub origin: Vector3<f32>,
    pub mesh: WarpMesh,
}

/// Highlight marker for the control point currently being edited.
#[derive(Debug, Clone, Default)]
pub struct VisualMarker {
    visible: bool,
    position: Option<Vector3<f32>>,
}

impl VisualMarker {
    pub fn show_at(&mut self, position: Vector3<f32>) {
        self.visible = true;
        self.position = Some(position);
    }

    pub fn hide(&mut self) {
        self.visible = false;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn position(&self) -> Option<Vector3<f32>> {
        self.position
    }
}

/// Hands each display a non-overlapping mesh-space origin. Owned by the
/// cluster setup orchestrator and threaded through every setup call.
#[derive(Debug, Clone)]
pub struct LayoutCursor {
    offset: Vector3<f32>,
    step: Vector3<f32>,
}

impl Default for LayoutCursor {
    fn default() -> Self {
        Self {
            offset: Vector3::zeros(),
            step: Vector3::new(10.0, 10.0, 10.0),
        }
    }
}

impl LayoutCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The origin for the next display; advances the cursor.
    pub fn advance(&mut self) -> Vector3<f32> {
        let current = self.offset;
        self.offset += self.step;
        current
    }
}

/// Owns one display's calibration state and its persistence.
#[derive(Debug, Clone)]
pub struct DisplayCalibration {
    surface: DisplaySurface,
    record: CalibrationRecord,
    warps: EyeMap<EyeWarp>,
    marker: VisualMarker,
    origin: Vector3<f32>,
    store: CalibrationStore,
}

impl DisplayCalibration {
    /// Build a display's calibration state: defaults from the config entry,
    /// overlaid with whatever the store holds (when `load_from_disk`), blend
    /// offsets applied, warp meshes generated.
    pub fn setup(
        config: &DisplayConfig,
        grid: GridConfig,
        store: CalibrationStore,
        load_from_disk: bool,
        cursor: &mut LayoutCursor,
    ) -> Result<Self, StoreError> {
        let mut surface = DisplaySurface::from_config(config);
        let mut record = CalibrationRecord {
            grid: ControlPointGrid::flat_default(grid.cols, grid.rows),
            position: Vector3::from(config.position),
            rotation: Vector3::from(config.rotation),
            blend: config.blend.clamped(),
            machine: config.machine.clone(),
        };

        if load_from_disk {
            let stored = store.load(&config.name)?;
            if let Some(points) = stored.points {
                let loaded = ControlPointGrid::from_points(grid.cols, grid.rows, points);
                if loaded.is_complete() {
                    record.grid = loaded;
                } else {
                    warn!(
                        "display {}: {} persisted points, expected {}; regenerating flat grid",
                        config.name,
                        loaded.points.len(),
                        loaded.point_count()
                    );
                }
            }
            if let Some(position) = stored.position {
                record.position = position;
            }
            if let Some(rotation) = stored.rotation {
                record.rotation = rotation;
            }
        }

        apply_blend(&mut record, &mut surface);

        let origin = cursor.advance();
        let mut calibration = Self {
            surface,
            record,
            warps: EyeMap::default(),
            marker: VisualMarker::default(),
            origin,
            store,
        };
        calibration.build_warps();
        debug!(
            "display {} set up with {} eye mesh(es)",
            calibration.surface.name,
            calibration.warps.len()
        );
        Ok(calibration)
    }

    /// The eye roles this display warps for.
    pub fn eye_roles(&self) -> &'static [Eye] {
        if self.surface.stereo {
            &[Eye::Left, Eye::Right]
        } else {
            &[Eye::Center]
        }
    }

    fn build_warps(&mut self) {
        let aspect = self.surface.aspect_ratio();
        let stereo = self.surface.stereo;
        let origin = self.origin;
        let mut warps = EyeMap::default();
        for &eye in self.eye_roles() {
            let x_shift = match eye {
                Eye::Left if stereo => -aspect * 2.0,
                Eye::Right if stereo => aspect * 2.0,
                _ => 0.0,
            };
            let mesh = WarpMesh::generate(&mut self.record.grid, aspect);
            warps.insert(
                eye,
                EyeWarp {
                    origin: origin + Vector3::new(x_shift, 0.0, 0.0),
                    mesh,
                },
            );
        }
        self.warps = warps;
    }

    fn rebuild_meshes(&mut self) {
        let aspect = self.surface.aspect_ratio();
        for warp in self.warps.values_mut() {
            warp.mesh = WarpMesh::generate(&mut self.record.grid, aspect);
        }
    }

    /// Apply a weighted vertex nudge to the control-point grid, then rebuild
    /// every eye mesh and persist.
    pub fn apply_vertex_shift(
        &mut self,
        influence: &HashMap<usize, f32>,
        direction: Vector3<f32>,
        delta: f32,
    ) -> Result<(), StoreError> {
        for (&index, &weight) in influence {
            if let Some(point) = self.record.grid.points.get_mut(index) {
                *point += direction * (delta * weight);
            }
        }
        self.rebuild_meshes();
        self.persist()
    }

    /// Nudge the display's position offset and persist.
    pub fn apply_position_shift(
        &mut self,
        direction: Vector3<f32>,
        delta: f32,
    ) -> Result<(), StoreError> {
        self.record.position += direction * delta;
        self.persist()
    }

    /// Nudge the display's Euler rotation and persist.
    pub fn apply_rotation_shift(
        &mut self,
        direction: Vector3<f32>,
        delta: f32,
    ) -> Result<(), StoreError> {
        self.record.rotation += direction * delta;
        self.persist()
    }

    /// Place the highlight marker on a control point.
    pub fn highlight_vertex(&mut self, vertex_index: usize) {
        let Some(point) = self.record.grid.points.get(vertex_index) else {
            return;
        };
        let scaled = Vector3::new(
            point.x * self.surface.aspect_ratio(),
            point.y,
            point.z,
        );
        let origin = self
            .warps
            .first()
            .map(|w| w.origin)
            .unwrap_or_else(Vector3::zeros);
        self.marker.show_at(origin + scaled);
    }

    pub fn hide_marker(&mut self) {
        self.marker.hide();
    }

    /// Write the record through to disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.store.save(
            &self.surface.name,
            &self.record.grid.points,
            &self.record.position,
            &self.record.rotation,
        )
    }

    pub fn surface(&self) -> &DisplaySurface {
        &self.surface
    }

    pub fn record(&self) -> &CalibrationRecord {
        &self.record
    }

    pub fn warps(&self) -> &EyeMap<EyeWarp> {
        &self.warps
    }

    pub fn marker(&self) -> &VisualMarker {
        &self.marker
    }
}

/// Center and size the blended region: the placement moves half the blend
/// imbalance along the display's local right and up axes, and the logical
/// size grows by the total overlap on each axis.
fn apply_blend(record: &mut CalibrationRecord, surface: &mut DisplaySurface) {
    let blend = record.blend;
    let half_width = surface.half_width();
    let half_height = surface.half_height();

    let orientation = record.orientation();
    let right = orientation * Vector3::x();
    let up = orientation * Vector3::y();

    record.position += right * ((blend.right - blend.left) * half_width * 0.5)
        + up * ((blend.top - blend.bottom) * half_height * 0.5);

    surface.width += (blend.left + blend.right) * half_width;
    surface.height += (blend.top + blend.bottom) * half_height;
}
