//! Warp mesh generation
//!
//! A warp mesh is the deformable quadrilateral grid an eye image is projected
//! through to match the physical screen. The mesh is derived data: it is
//! regenerated from the control-point grid whenever the grid mutates and is
//! never persisted itself.

use nalgebra::{Vector2, Vector3, Vector4};

/// Default grid dimensions, in cells. Fixed for the lifetime of a session.
pub const GRID_COLS: usize = 7;
pub const GRID_ROWS: usize = 7;

/// Number of vertices in a `cols x rows` cell grid.
pub fn vertex_count(cols: usize, rows: usize) -> usize {
    (cols + 1) * (rows + 1)
}

/// The manually tuned control points behind one display's warp mesh.
///
/// Points are stored row-major starting at the bottom-left corner. A complete
/// grid holds exactly `(cols+1)*(rows+1)` points; anything else is treated as
/// stale and replaced by the flat default when a mesh is generated from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPointGrid {
    pub cols: usize,
    pub rows: usize,
    pub points: Vec<Vector3<f32>>,
}

impl ControlPointGrid {
    /// A flat grid spanning [-1,1] on both axes at z=0.
    pub fn flat_default(cols: usize, rows: usize) -> Self {
        let mut points = Vec::with_capacity(vertex_count(cols, rows));
        for y in 0..=rows {
            for x in 0..=cols {
                points.push(Vector3::new(
                    x as f32 * 2.0 / cols as f32 - 1.0,
                    y as f32 * 2.0 / rows as f32 - 1.0,
                    0.0,
                ));
            }
        }
        Self { cols, rows, points }
    }

    /// Wrap an already-loaded point list. The list may be incomplete; it is
    /// healed on the next mesh generation.
    pub fn from_points(cols: usize, rows: usize, points: Vec<Vector3<f32>>) -> Self {
        Self { cols, rows, points }
    }

    pub fn point_count(&self) -> usize {
        vertex_count(self.cols, self.rows)
    }

    /// True when the stored point count matches the grid dimensions.
    pub fn is_complete(&self) -> bool {
        self.points.len() == self.point_count()
    }
}

/// A renderable warp mesh: positions, UVs, tangents, normals and the fixed
/// two-triangle-per-cell topology.
#[derive(Debug, Clone)]
pub struct WarpMesh {
    pub positions: Vec<Vector3<f32>>,
    pub uvs: Vec<Vector2<f32>>,
    pub tangents: Vec<Vector4<f32>>,
    pub normals: Vec<Vector3<f32>>,
    pub indices: Vec<u32>,
}

impl WarpMesh {
    /// Generate a mesh from a control-point grid.
    ///
    /// Positions are the grid points scaled by `(aspect_ratio, 1.0)` so the
    /// mesh matches the display's proportions. If the grid's point count does
    /// not match its dimensions the grid self-heals: it is replaced by the
    /// flat default, and that default becomes the authoritative grid for all
    /// later edits and saves.
    pub fn generate(grid: &mut ControlPointGrid, aspect_ratio: f32) -> Self {
        if !grid.is_complete() {
            *grid = ControlPointGrid::flat_default(grid.cols, grid.rows);
        }

        let cols = grid.cols;
        let rows = grid.rows;
        let count = vertex_count(cols, rows);

        let mut positions = Vec::with_capacity(count);
        let mut uvs = Vec::with_capacity(count);
        let tangent = Vector4::new(1.0, 0.0, 0.0, -1.0);

        for y in 0..=rows {
            for x in 0..=cols {
                let p = grid.points[y * (cols + 1) + x];
                positions.push(Vector3::new(p.x * aspect_ratio, p.y, p.z));
                uvs.push(Vector2::new(x as f32 / cols as f32, y as f32 / rows as f32));
            }
        }

        let indices = cell_triangles(cols, rows);
        let normals = recompute_normals(&positions, &indices);

        Self {
            positions,
            uvs,
            tangents: vec![tangent; count],
            normals,
            indices,
        }
    }
}

/// The fixed tessellation: two triangles per cell, independent of point
/// values. For the cell whose bottom-left vertex is `v` the triangles are
/// `{v, v+cols+1, v+1}` and `{v+1, v+cols+1, v+cols+2}`.
fn cell_triangles(cols: usize, rows: usize) -> Vec<u32> {
    let mut indices = Vec::with_capacity(cols * rows * 6);
    let stride = cols as u32 + 1;
    let mut v = 0u32;
    for _y in 0..rows {
        for _x in 0..cols {
            indices.push(v);
            indices.push(v + stride);
            indices.push(v + 1);
            indices.push(v + 1);
            indices.push(v + stride);
            indices.push(v + stride + 1);
            v += 1;
        }
        v += 1; // skip the row's last vertex, it owns no cell
    }
    indices
}

/// Per-vertex normals from area-weighted face normal accumulation.
fn recompute_normals(positions: &[Vector3<f32>], indices: &[u32]) -> Vec<Vector3<f32>> {
    let mut normals = vec![Vector3::zeros(); positions.len()];
    for tri in indices.chunks_exact(3) {
        let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        let face = (positions[b] - positions[a]).cross(&(positions[c] - positions[a]));
        normals[a] += face;
        normals[b] += face;
        normals[c] += face;
    }
    for n in &mut normals {
        let len = n.norm();
        *n = if len > 1e-12 {
            *n / len
        } else {
            // degenerate cell fan, fall back to the flat-grid facing
            -Vector3::z()
        };
    }
    normals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_and_triangle_counts() {
        for (cols, rows) in [(7, 7), (3, 2), (1, 1), (5, 9)] {
            let mut grid = ControlPointGrid::flat_default(cols, rows);
            let mesh = WarpMesh::generate(&mut grid, 1.0);
            assert_eq!(mesh.positions.len(), (cols + 1) * (rows + 1));
            assert_eq!(mesh.uvs.len(), mesh.positions.len());
            assert_eq!(mesh.tangents.len(), mesh.positions.len());
            assert_eq!(mesh.normals.len(), mesh.positions.len());
            assert_eq!(mesh.indices.len(), cols * rows * 6);
        }
    }

    #[test]
    fn test_cell_winding() {
        let mut grid = ControlPointGrid::flat_default(7, 7);
        let mesh = WarpMesh::generate(&mut grid, 1.0);
        // First cell: bottom-left vertex 0, row stride 8.
        assert_eq!(&mesh.indices[..6], &[0, 8, 1, 1, 8, 9]);
        // Second row's first cell starts at vertex 8.
        assert_eq!(&mesh.indices[7 * 6..7 * 6 + 6], &[8, 16, 9, 9, 16, 17]);
    }

    #[test]
    fn test_default_grid_spans_unit_square() {
        let grid = ControlPointGrid::flat_default(7, 7);
        assert_eq!(grid.points.len(), 64);
        let first = grid.points[0];
        let last = grid.points[63];
        assert!((first.x + 1.0).abs() < 1e-6 && (first.y + 1.0).abs() < 1e-6);
        assert!((last.x - 1.0).abs() < 1e-6 && (last.y - 1.0).abs() < 1e-6);
        assert!(grid.points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_incomplete_grid_self_heals() {
        let mut grid = ControlPointGrid::from_points(
            7,
            7,
            vec![Vector3::new(0.5, 0.5, 0.0); 10], // wrong count
        );
        let mesh = WarpMesh::generate(&mut grid, 1.0);
        assert!(grid.is_complete());
        assert_eq!(grid, ControlPointGrid::flat_default(7, 7));
        assert_eq!(mesh.positions.len(), 64);
    }

    #[test]
    fn test_aspect_ratio_scales_x_only() {
        let mut grid = ControlPointGrid::flat_default(7, 7);
        let mesh = WarpMesh::generate(&mut grid, 16.0 / 9.0);
        let corner = mesh.positions[63];
        assert!((corner.x - 16.0 / 9.0).abs() < 1e-6);
        assert!((corner.y - 1.0).abs() < 1e-6);
        // the grid itself stays unscaled
        assert!((grid.points[63].x - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_uv_corners() {
        let mut grid = ControlPointGrid::flat_default(7, 7);
        let mesh = WarpMesh::generate(&mut grid, 1.0);
        assert_eq!(mesh.uvs[0], Vector2::new(0.0, 0.0));
        assert_eq!(mesh.uvs[7], Vector2::new(1.0, 0.0));
        assert_eq!(mesh.uvs[63], Vector2::new(1.0, 1.0));
    }

    #[test]
    fn test_flat_grid_normals_face_forward() {
        let mut grid = ControlPointGrid::flat_default(7, 7);
        let mesh = WarpMesh::generate(&mut grid, 1.0);
        for n in &mesh.normals {
            assert!((n.z + 1.0).abs() < 1e-6, "expected -z normal, got {:?}", n);
        }
    }
}
