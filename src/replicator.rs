//! Replicated calibration-edit protocol
//!
//! One node is authoritative: it turns operator actions into local mutations
//! and broadcasts the same scalar parameters to every peer, which replays
//! them through the identical deterministic apply routine. Peers never
//! re-derive state from raw input and never publish, so the whole cluster
//! stays bit-consistent without ever moving mesh data over the network.
//!
//! Because every edit is a relative delta, commands must be applied in
//! publish order; an out-of-order or misaddressed command means the cluster
//! lists diverged and is fatal.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::display::DisplayCalibration;
use crate::influence;
use crate::net::{CalibrationCommand, CommandPublisher};
use crate::store::StoreError;

/// What an operator nudge currently edits. Cycled in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    Vertex,
    Position,
    Rotation,
}

impl CalibrationMode {
    pub fn next(self) -> Self {
        match self {
            CalibrationMode::Vertex => CalibrationMode::Position,
            CalibrationMode::Position => CalibrationMode::Rotation,
            CalibrationMode::Rotation => CalibrationMode::Vertex,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CalibrationMode::Vertex => "VERTEX",
            CalibrationMode::Position => "POSITION",
            CalibrationMode::Rotation => "ROTATION",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("selection index {index} outside cluster list of {len} targets")]
    SelectionOutOfRange { index: usize, len: usize },
    #[error("vertex index {index} outside grid of {len} vertices")]
    VertexOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// On-screen status text following the focused display: shows the current
/// calibration mode next to whichever surface is being edited.
#[derive(Debug, Clone, Default)]
pub struct InfoOverlay {
    visible: bool,
    attached_to: Option<usize>,
    text: String,
}

impl InfoOverlay {
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn attached_to(&self) -> Option<usize> {
        self.attached_to
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// The distributed calibration controller.
pub struct CalibrationReplicator {
    /// Cluster-wide ordered target list; built once at session start and
    /// identical on every node. Commands address into it by index.
    targets: Vec<DisplayCalibration>,
    mode: CalibrationMode,
    selected_index: usize,
    last_selected_index: usize,
    vertex_index: usize,
    grid_select_size: usize,
    overlay: InfoOverlay,
    publisher: Box<dyn CommandPublisher>,
}

impl CalibrationReplicator {
    pub fn new(targets: Vec<DisplayCalibration>, publisher: Box<dyn CommandPublisher>) -> Self {
        info!("Replicator managing {} calibration targets", targets.len());
        Self {
            targets,
            mode: CalibrationMode::Vertex,
            selected_index: 0,
            last_selected_index: 0,
            vertex_index: 0,
            grid_select_size: 1,
            overlay: InfoOverlay::default(),
            publisher,
        }
    }

    fn vertex_capacity(&self) -> usize {
        self.targets
            .get(self.selected_index)
            .map(|t| t.record().grid.point_count())
            .unwrap_or(0)
    }

    // ---- authority operations: apply locally, then broadcast ----

    /// Nudge whatever the current mode selects on the focused display.
    pub fn shift(&mut self, direction: Vector3<f32>, delta: f32) -> Result<(), ReplicatorError> {
        match self.mode {
            CalibrationMode::Vertex => self.vertex_shift(direction, delta),
            CalibrationMode::Position => self.position_shift(direction, delta),
            CalibrationMode::Rotation => self.rotation_shift(direction, delta),
        }
    }

    fn vertex_shift(&mut self, direction: Vector3<f32>, delta: f32) -> Result<(), ReplicatorError> {
        if self.targets.is_empty() {
            return Ok(());
        }
        let (selection_index, vertex_index) = (self.selected_index, self.vertex_index);
        self.local_shift(direction, delta, selection_index, vertex_index)?;
        self.publisher.publish(CalibrationCommand::Shift {
            direction: [direction.x, direction.y, direction.z],
            delta,
            selection_index,
            vertex_index,
        });
        Ok(())
    }

    fn position_shift(&mut self, direction: Vector3<f32>, delta: f32) -> Result<(), ReplicatorError> {
        if self.targets.is_empty() {
            return Ok(());
        }
        let selection_index = self.selected_index;
        self.local_position_shift(direction, delta, selection_index)?;
        self.publisher.publish(CalibrationCommand::MovePosition {
            direction: [direction.x, direction.y, direction.z],
            delta,
            selection_index,
        });
        Ok(())
    }

    fn rotation_shift(&mut self, direction: Vector3<f32>, delta: f32) -> Result<(), ReplicatorError> {
        if self.targets.is_empty() {
            return Ok(());
        }
        let selection_index = self.selected_index;
        self.local_rotation_shift(direction, delta, selection_index)?;
        self.publisher.publish(CalibrationCommand::Rotate {
            direction: [direction.x, direction.y, direction.z],
            delta,
            selection_index,
        });
        Ok(())
    }

    /// Focus the next display in the cluster list, wrapping.
    pub fn select_next(&mut self) -> Result<(), ReplicatorError> {
        if self.targets.is_empty() {
            return Ok(());
        }
        self.selected_index = (self.selected_index + 1) % self.targets.len();
        self.after_selection_change()
    }

    /// Focus the previous display, wrapping below zero to the end.
    pub fn select_previous(&mut self) -> Result<(), ReplicatorError> {
        if self.targets.is_empty() {
            return Ok(());
        }
        let len = self.targets.len();
        self.selected_index = (self.selected_index + len - 1) % len;
        self.after_selection_change()
    }

    fn after_selection_change(&mut self) -> Result<(), ReplicatorError> {
        self.focus_info_display();
        // zero-delta shift so every node re-homes its highlight marker
        self.vertex_shift(Vector3::zeros(), 1.0)?;
        self.set_last_index(self.selected_index);
        Ok(())
    }

    /// Focus the next control point of the selected display, wrapping.
    pub fn select_next_vertex(&mut self) -> Result<(), ReplicatorError> {
        let capacity = self.vertex_capacity();
        if capacity == 0 {
            return Ok(());
        }
        self.vertex_index = (self.vertex_index + 1) % capacity;
        debug!("vertex cursor -> {}", self.vertex_index);
        self.vertex_shift(Vector3::zeros(), 1.0)
    }

    pub fn select_previous_vertex(&mut self) -> Result<(), ReplicatorError> {
        let capacity = self.vertex_capacity();
        if capacity == 0 {
            return Ok(());
        }
        self.vertex_index = (self.vertex_index + capacity - 1) % capacity;
        debug!("vertex cursor -> {}", self.vertex_index);
        self.vertex_shift(Vector3::zeros(), 1.0)
    }

    /// Advance the calibration mode, wrapping after the last.
    pub fn cycle_mode(&mut self) {
        let mode = self.mode.next();
        self.local_set_mode(mode);
        self.publisher.publish(CalibrationCommand::SetMode { mode });
    }

    /// Grow or shrink the grid-select radius; shrinking floors at 0.
    pub fn adjust_grid_select_size(&mut self, increase: bool) {
        self.local_adjust_grid_select_size(increase);
        self.publisher
            .publish(CalibrationCommand::AdjustGridSelectSize { increase });
    }

    /// Attach the info overlay to the focused display, on every node.
    pub fn focus_info_display(&mut self) {
        let index = self.selected_index;
        self.local_focus_info(index);
        self.publisher
            .publish(CalibrationCommand::FocusInfoDisplay { index });
    }

    fn set_last_index(&mut self, index: usize) {
        self.local_set_last_index(index);
        self.publisher
            .publish(CalibrationCommand::SetLastIndex { index });
    }

    // ---- deterministic local applies, shared by authority and replicas ----

    /// Replay one command received from the authority.
    pub fn apply(&mut self, command: CalibrationCommand) -> Result<(), ReplicatorError> {
        match command {
            CalibrationCommand::Shift {
                direction,
                delta,
                selection_index,
                vertex_index,
            } => self.local_shift(Vector3::from(direction), delta, selection_index, vertex_index),
            CalibrationCommand::MovePosition {
                direction,
                delta,
                selection_index,
            } => self.local_position_shift(Vector3::from(direction), delta, selection_index),
            CalibrationCommand::Rotate {
                direction,
                delta,
                selection_index,
            } => self.local_rotation_shift(Vector3::from(direction), delta, selection_index),
            CalibrationCommand::SetMode { mode } => {
                self.local_set_mode(mode);
                Ok(())
            }
            CalibrationCommand::SetLastIndex { index } => {
                self.local_set_last_index(index);
                Ok(())
            }
            CalibrationCommand::AdjustGridSelectSize { increase } => {
                self.local_adjust_grid_select_size(increase);
                Ok(())
            }
            CalibrationCommand::FocusInfoDisplay { index } => {
                self.local_focus_info(index);
                Ok(())
            }
        }
    }

    fn target_mut(&mut self, index: usize) -> Result<&mut DisplayCalibration, ReplicatorError> {
        let len = self.targets.len();
        self.targets
            .get_mut(index)
            .ok_or(ReplicatorError::SelectionOutOfRange { index, len })
    }

    fn local_shift(
        &mut self,
        direction: Vector3<f32>,
        delta: f32,
        selection_index: usize,
        vertex_index: usize,
    ) -> Result<(), ReplicatorError> {
        let last = self.last_selected_index;
        if let Some(previous) = self.targets.get_mut(last) {
            previous.hide_marker();
        }

        let radius = self.grid_select_size;
        let target = self.target_mut(selection_index)?;
        let capacity = target.record().grid.point_count();
        if vertex_index >= capacity {
            return Err(ReplicatorError::VertexOutOfRange {
                index: vertex_index,
                len: capacity,
            });
        }
        target.highlight_vertex(vertex_index);

        let cols = target.record().grid.cols;
        let map = influence::influence_map(cols, vertex_index, radius);
        target.apply_vertex_shift(&map, direction, delta)?;
        debug!(
            "shift {:?} * {} on target {} vertex {}",
            direction, delta, selection_index, vertex_index
        );
        Ok(())
    }

    fn local_position_shift(
        &mut self,
        direction: Vector3<f32>,
        delta: f32,
        selection_index: usize,
    ) -> Result<(), ReplicatorError> {
        let last = self.last_selected_index;
        if let Some(previous) = self.targets.get_mut(last) {
            previous.hide_marker();
        }
        let vertex_index = self.vertex_index;
        let target = self.target_mut(selection_index)?;
        target.highlight_vertex(vertex_index);
        target.apply_position_shift(direction, delta)?;
        Ok(())
    }

    fn local_rotation_shift(
        &mut self,
        direction: Vector3<f32>,
        delta: f32,
        selection_index: usize,
    ) -> Result<(), ReplicatorError> {
        let last = self.last_selected_index;
        if let Some(previous) = self.targets.get_mut(last) {
            previous.hide_marker();
        }
        let vertex_index = self.vertex_index;
        let target = self.target_mut(selection_index)?;
        target.highlight_vertex(vertex_index);
        target.apply_rotation_shift(direction, delta)?;
        Ok(())
    }

    fn local_set_mode(&mut self, mode: CalibrationMode) {
        self.mode = mode;
        self.overlay.text = mode.label().to_string();
        info!("calibration mode: {}", mode.label());
    }

    fn local_set_last_index(&mut self, index: usize) {
        self.last_selected_index = index;
    }

    fn local_adjust_grid_select_size(&mut self, increase: bool) {
        if increase {
            self.grid_select_size += 1;
        } else {
            self.grid_select_size = self.grid_select_size.saturating_sub(1);
        }
        debug!("grid select size: {}", self.grid_select_size);
    }

    fn local_focus_info(&mut self, index: usize) {
        if self.targets.get(index).is_none() {
            return;
        }
        self.overlay.visible = true;
        self.overlay.attached_to = Some(index);
        self.overlay.text = self.mode.label().to_string();
    }

    // ---- session teardown ----

    /// Persist calibration records at shutdown. With `this_machine_only`,
    /// only records owned by `machine` are written.
    pub fn save_all(&self, machine: &str, this_machine_only: bool) {
        for target in &self.targets {
            if this_machine_only && target.record().machine != machine {
                continue;
            }
            match target.persist() {
                Ok(()) => debug!("saved calibration for {}", target.surface().name),
                Err(e) => tracing::error!(
                    "Failed to save calibration for {}: {}",
                    target.surface().name,
                    e
                ),
            }
        }
    }

    // ---- accessors ----

    pub fn mode(&self) -> CalibrationMode {
        self.mode
    }

    pub fn selected_index(&self) -> usize {
        self.selected_index
    }

    pub fn last_selected_index(&self) -> usize {
        self.last_selected_index
    }

    pub fn vertex_index(&self) -> usize {
        self.vertex_index
    }

    pub fn grid_select_size(&self) -> usize {
        self.grid_select_size
    }

    pub fn overlay(&self) -> &InfoOverlay {
        &self.overlay
    }

    pub fn target(&self, index: usize) -> Option<&DisplayCalibration> {
        self.targets.get(index)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlendConfig, DisplayConfig, GridConfig};
    use crate::display::LayoutCursor;
    use crate::net::NullPublisher;
    use crate::store::CalibrationStore;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct RecordingPublisher(Arc<Mutex<Vec<CalibrationCommand>>>);

    impl CommandPublisher for RecordingPublisher {
        fn publish(&mut self, command: CalibrationCommand) {
            self.0.lock().push(command);
        }
    }

    fn display_config(name: &str, machine: &str) -> DisplayConfig {
        DisplayConfig {
            name: name.to_string(),
            machine: machine.to_string(),
            width: 2.0,
            height: 2.0,
            resolution: [1280, 720],
            stereo: false,
            position: [0.0; 3],
            rotation: [0.0; 3],
            blend: BlendConfig::default(),
        }
    }

    fn build_targets(dir: &TempDir, count: usize) -> Vec<DisplayCalibration> {
        let store = CalibrationStore::new(dir.path());
        let mut cursor = LayoutCursor::new();
        (0..count)
            .map(|i| {
                DisplayCalibration::setup(
                    &display_config(&format!("d{}", i), "node-a"),
                    GridConfig::default(),
                    store.clone(),
                    false,
                    &mut cursor,
                )
                .unwrap()
            })
            .collect()
    }

    fn replicator(dir: &TempDir, count: usize) -> CalibrationReplicator {
        CalibrationReplicator::new(build_targets(dir, count), Box::new(NullPublisher))
    }

    #[test]
    fn test_select_previous_wraps_to_end() {
        let dir = TempDir::new().unwrap();
        let mut rep = replicator(&dir, 5);
        assert_eq!(rep.selected_index(), 0);
        rep.select_previous().unwrap();
        assert_eq!(rep.selected_index(), 4);
        rep.select_next().unwrap();
        assert_eq!(rep.selected_index(), 0);
    }

    #[test]
    fn test_mode_cycles_in_order() {
        let dir = TempDir::new().unwrap();
        let mut rep = replicator(&dir, 1);
        assert_eq!(rep.mode(), CalibrationMode::Vertex);
        rep.cycle_mode();
        assert_eq!(rep.mode(), CalibrationMode::Position);
        rep.cycle_mode();
        assert_eq!(rep.mode(), CalibrationMode::Rotation);
        rep.cycle_mode();
        assert_eq!(rep.mode(), CalibrationMode::Vertex);
    }

    #[test]
    fn test_vertex_cursor_wraps_modulo_grid() {
        let dir = TempDir::new().unwrap();
        let mut rep = replicator(&dir, 1);
        rep.select_previous_vertex().unwrap();
        assert_eq!(rep.vertex_index(), 63);
        rep.select_next_vertex().unwrap();
        assert_eq!(rep.vertex_index(), 0);
    }

    #[test]
    fn test_grid_select_size_floors_at_zero() {
        let dir = TempDir::new().unwrap();
        let mut rep = replicator(&dir, 1);
        assert_eq!(rep.grid_select_size(), 1);
        rep.adjust_grid_select_size(false);
        rep.adjust_grid_select_size(false);
        assert_eq!(rep.grid_select_size(), 0);
        rep.adjust_grid_select_size(true);
        assert_eq!(rep.grid_select_size(), 1);
    }

    #[test]
    fn test_center_shift_moves_weighted_neighborhood() {
        let dir = TempDir::new().unwrap();
        let mut rep = replicator(&dir, 1);
        let flat = crate::mesh::ControlPointGrid::flat_default(7, 7);

        // radius defaults to 1; act as a replica so we can address vertex 36
        rep.apply(CalibrationCommand::Shift {
            direction: [1.0, 0.0, 0.0],
            delta: 1.0,
            selection_index: 0,
            vertex_index: 36,
        })
        .unwrap();

        let grid = &rep.target(0).unwrap().record().grid;
        let moved = |i: usize| grid.points[i].x - flat.points[i].x;
        assert!((moved(36) - 1.0).abs() < 1e-6);
        assert!((moved(35) - 0.25).abs() < 1e-6);
        assert!((moved(37) - 0.25).abs() < 1e-6);
        assert!((moved(28) - 0.5).abs() < 1e-6);
        assert!((moved(44) - 0.5).abs() < 1e-6);
        // outside the 1-neighborhood nothing moves
        for i in [0, 7, 20, 52, 63] {
            assert_eq!(moved(i), 0.0, "vertex {} should be untouched", i);
        }
        // y and z are untouched everywhere
        for (a, b) in grid.points.iter().zip(&flat.points) {
            assert_eq!(a.y, b.y);
            assert_eq!(a.z, b.z);
        }
    }

    #[test]
    fn test_marker_hand_off_between_targets() {
        let dir = TempDir::new().unwrap();
        let mut rep = replicator(&dir, 3);
        rep.shift(Vector3::new(1.0, 0.0, 0.0), 0.0015).unwrap();
        assert!(rep.target(0).unwrap().marker().is_visible());

        rep.select_next().unwrap();
        assert!(!rep.target(0).unwrap().marker().is_visible());
        assert!(rep.target(1).unwrap().marker().is_visible());
        assert_eq!(rep.last_selected_index(), 1);
    }

    #[test]
    fn test_out_of_range_selection_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut rep = replicator(&dir, 2);
        let err = rep
            .apply(CalibrationCommand::MovePosition {
                direction: [1.0, 0.0, 0.0],
                delta: 0.0015,
                selection_index: 7,
            })
            .unwrap_err();
        match err {
            ReplicatorError::SelectionOutOfRange { index, len } => {
                assert_eq!(index, 7);
                assert_eq!(len, 2);
            }
            other => panic!("expected selection error, got {:?}", other),
        }
    }

    #[test]
    fn test_authority_and_replica_converge() {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let authority_dir = TempDir::new().unwrap();
        let mut authority = CalibrationReplicator::new(
            build_targets(&authority_dir, 3),
            Box::new(RecordingPublisher(recorded.clone())),
        );

        authority.shift(Vector3::new(1.0, 0.0, 0.0), 0.0015).unwrap();
        authority.adjust_grid_select_size(true);
        authority.shift(Vector3::new(0.0, -1.0, 0.0), 0.0015).unwrap();
        authority.select_next().unwrap();
        authority.cycle_mode(); // -> Position
        authority.shift(Vector3::new(0.0, 1.0, 0.0), 0.0015).unwrap();
        authority.cycle_mode(); // -> Rotation
        authority.shift(Vector3::new(1.0, 0.0, 0.0), 0.10).unwrap();
        authority.select_next_vertex().unwrap();
        authority.cycle_mode(); // -> Vertex
        authority.shift(Vector3::new(0.0, 0.0, 1.0), 0.0015).unwrap();

        let replica_dir = TempDir::new().unwrap();
        let mut replica = CalibrationReplicator::new(
            build_targets(&replica_dir, 3),
            Box::new(NullPublisher),
        );
        for command in recorded.lock().iter().cloned() {
            replica.apply(command).unwrap();
        }

        for i in 0..3 {
            let a = authority.target(i).unwrap().record();
            let b = replica.target(i).unwrap().record();
            assert_eq!(a.grid.points, b.grid.points, "grid diverged on target {}", i);
            assert_eq!(a.position, b.position, "position diverged on target {}", i);
            assert_eq!(a.rotation, b.rotation, "rotation diverged on target {}", i);
        }
        assert_eq!(authority.mode(), replica.mode());
        assert_eq!(
            authority.grid_select_size(),
            replica.grid_select_size()
        );
        assert_eq!(
            authority.last_selected_index(),
            replica.last_selected_index()
        );
    }
}
