//! Per-display calibration persistence
//!
//! Each display owns a namespace directory holding four artifacts:
//!
//! | file | content |
//! |---|---|
//! | `WARP-<display>.conf` | one `x\|y\|z` control point per line |
//! | `POS-<display>.conf` | local position offset, single line |
//! | `ROT-<display>.conf` | local Euler rotation in degrees, single line |
//! | `ROTGLOBAL-<display>.conf` | partial quaternion snapshot, write-only |
//!
//! Loading is tolerant: a missing file leaves that portion of the record at
//! its in-memory default, and lines with too few fields are skipped. Decimal
//! commas from locale-tainted writers are normalized to `.` on read. A token
//! that is present but not a number is a hard [`StoreError::Parse`]; it halts
//! calibration loading for that display.

use nalgebra::{UnitQuaternion, Vector3};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Persistence failures surfaced to the setup path.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid number {token:?} in {path:?}")]
    Parse { path: PathBuf, token: String },
}

/// What a load recovered. Every field is independently optional; `None`
/// means the artifact was absent and the in-memory default should stand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredCalibration {
    pub points: Option<Vec<Vector3<f32>>>,
    pub position: Option<Vector3<f32>>,
    pub rotation: Option<Vector3<f32>>,
}

/// Reads and writes one display's calibration record under a shared root
/// directory, one subdirectory per display.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    root: PathBuf,
}

impl CalibrationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn artifact_path(&self, display: &str, kind: &str) -> PathBuf {
        self.root
            .join(display)
            .join(format!("{}-{}.conf", kind, display))
    }

    /// Load whatever artifacts exist for `display`.
    pub fn load(&self, display: &str) -> Result<StoredCalibration, StoreError> {
        let mut stored = StoredCalibration::default();

        let warp = self.artifact_path(display, "WARP");
        if let Some(content) = read_optional(&warp)? {
            let mut points = Vec::new();
            for line in content.lines() {
                if let Some(v) = parse_vector_line(line, &warp)? {
                    points.push(v);
                }
            }
            debug!("loaded {} warp points from {:?}", points.len(), warp);
            stored.points = Some(points);
        }

        let pos = self.artifact_path(display, "POS");
        if let Some(content) = read_optional(&pos)? {
            stored.position = parse_vector_line(content.trim(), &pos)?;
        }

        let rot = self.artifact_path(display, "ROT");
        if let Some(content) = read_optional(&rot)? {
            stored.rotation = parse_vector_line(content.trim(), &rot)?;
        }

        // ROTGLOBAL is a legacy write-only snapshot and is deliberately
        // never reloaded.

        Ok(stored)
    }

    /// Write all four artifacts, overwriting any prior content.
    pub fn save(
        &self,
        display: &str,
        points: &[Vector3<f32>],
        position: &Vector3<f32>,
        rotation: &Vector3<f32>,
    ) -> Result<(), StoreError> {
        let dir = self.root.join(display);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut warp = String::new();
        for p in points {
            warp.push_str(&format!("{}|{}|{}\n", p.x, p.y, p.z));
        }
        write_artifact(&self.artifact_path(display, "WARP"), &warp)?;

        write_artifact(
            &self.artifact_path(display, "POS"),
            &format!("{}|{}|{}", position.x, position.y, position.z),
        )?;

        write_artifact(
            &self.artifact_path(display, "ROT"),
            &format!("{}|{}|{}", rotation.x, rotation.y, rotation.z),
        )?;

        // First three quaternion components only, matching the historic
        // format other tooling may still read.
        let q = UnitQuaternion::from_euler_angles(
            rotation.x.to_radians(),
            rotation.y.to_radians(),
            rotation.z.to_radians(),
        );
        write_artifact(
            &self.artifact_path(display, "ROTGLOBAL"),
            &format!("{}|{}|{}", q.i, q.j, q.k),
        )?;

        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    if !path.exists() {
        debug!("no artifact at {:?}, keeping defaults", path);
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn write_artifact(path: &Path, content: &str) -> Result<(), StoreError> {
    fs::write(path, content).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse one `x|y|z` line. Lines with fewer than three fields are skipped
/// (`Ok(None)`); a non-numeric token is a parse failure.
fn parse_vector_line(line: &str, path: &Path) -> Result<Option<Vector3<f32>>, StoreError> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 3 {
        return Ok(None);
    }
    let mut fields = [0f32; 3];
    for (slot, token) in fields.iter_mut().zip(&parts) {
        let normalized = token.trim().replace(',', ".");
        *slot = normalized.parse().map_err(|_| StoreError::Parse {
            path: path.to_path_buf(),
            token: (*token).to_string(),
        })?;
    }
    Ok(Some(Vector3::new(fields[0], fields[1], fields[2])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, CalibrationStore) {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_round_trip() {
        let (_dir, store) = store();
        let points: Vec<Vector3<f32>> = (0..64)
            .map(|i| Vector3::new(i as f32 * 0.031 - 1.0, -(i as f32) * 0.017, 0.001 * i as f32))
            .collect();
        let position = Vector3::new(0.25, -1.5, 3.0);
        let rotation = Vector3::new(10.0, -20.0, 0.5);

        store.save("wall-left", &points, &position, &rotation).unwrap();
        let stored = store.load("wall-left").unwrap();

        let loaded = stored.points.unwrap();
        assert_eq!(loaded.len(), points.len());
        for (a, b) in loaded.iter().zip(&points) {
            assert!((a - b).norm() < 1e-5);
        }
        assert!((stored.position.unwrap() - position).norm() < 1e-5);
        assert!((stored.rotation.unwrap() - rotation).norm() < 1e-5);
    }

    #[test]
    fn test_comma_decimals_normalized() {
        let (dir, store) = store();
        let ns = dir.path().join("wall-front");
        fs::create_dir_all(&ns).unwrap();
        fs::write(ns.join("WARP-wall-front.conf"), "0,5|-0,25|0\n1,0|1,0|0\n").unwrap();
        fs::write(ns.join("POS-wall-front.conf"), "0,1|0,2|0,3").unwrap();

        let stored = store.load("wall-front").unwrap();
        let points = stored.points.unwrap();
        assert!((points[0] - Vector3::new(0.5, -0.25, 0.0)).norm() < 1e-6);
        assert!((points[1] - Vector3::new(1.0, 1.0, 0.0)).norm() < 1e-6);
        assert!((stored.position.unwrap() - Vector3::new(0.1, 0.2, 0.3)).norm() < 1e-6);
    }

    #[test]
    fn test_short_lines_skipped_silently() {
        let (dir, store) = store();
        let ns = dir.path().join("d0");
        fs::create_dir_all(&ns).unwrap();
        let mut content = String::new();
        for i in 0..64 {
            if i == 10 || i == 40 {
                content.push_str("0.5\n"); // one field only
            } else {
                content.push_str(&format!("{}|{}|0\n", i, i));
            }
        }
        fs::write(ns.join("WARP-d0.conf"), content).unwrap();

        let stored = store.load("d0").unwrap();
        assert_eq!(stored.points.unwrap().len(), 62);
    }

    #[test]
    fn test_missing_artifacts_are_defaults() {
        let (_dir, store) = store();
        let stored = store.load("never-saved").unwrap();
        assert_eq!(stored, StoredCalibration::default());
    }

    #[test]
    fn test_non_numeric_token_is_parse_error() {
        let (dir, store) = store();
        let ns = dir.path().join("d1");
        fs::create_dir_all(&ns).unwrap();
        fs::write(ns.join("WARP-d1.conf"), "0|0|0\nnope|1|2\n").unwrap();

        match store.load("d1") {
            Err(StoreError::Parse { token, .. }) => assert_eq!(token, "nope"),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_rotglobal_written_but_never_read() {
        let (dir, store) = store();
        store
            .save("d2", &[], &Vector3::zeros(), &Vector3::new(0.0, 90.0, 0.0))
            .unwrap();
        let path = dir.path().join("d2").join("ROTGLOBAL-d2.conf");
        assert!(path.exists());

        // corrupt it; load must not care
        fs::write(&path, "garbage").unwrap();
        assert!(store.load("d2").is_ok());
    }
}
