//! Cluster session setup
//!
//! The shared config's display list stands in for live display discovery:
//! every node walks it in file order, so the resulting target list — the one
//! the replicated protocol addresses by index — is identical cluster-wide.

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::Config;
use crate::display::{DisplayCalibration, LayoutCursor};
use crate::store::CalibrationStore;

/// Build the ordered calibration target list for this session.
///
/// A display whose persisted calibration is corrupt starts flat instead of
/// taking the whole session down: the parse failure is logged, the record
/// keeps its config defaults, and the on-disk files are overwritten on the
/// next edit or teardown save.
pub fn build_targets(config: &Config, store: &CalibrationStore) -> Result<Vec<DisplayCalibration>> {
    let mut cursor = LayoutCursor::new();
    let mut targets = Vec::with_capacity(config.displays.len());

    for disp in &config.displays {
        let calibration = match DisplayCalibration::setup(
            disp,
            config.grid,
            store.clone(),
            config.load_calibration_on_start,
            &mut cursor,
        ) {
            Ok(calibration) => calibration,
            Err(e) => {
                error!(
                    "Calibration load failed for display {}: {}; starting uncalibrated",
                    disp.name, e
                );
                DisplayCalibration::setup(disp, config.grid, store.clone(), false, &mut cursor)
                    .with_context(|| format!("Failed to set up display {}", disp.name))?
            }
        };
        targets.push(calibration);
    }

    info!("Found {} calibration targets", targets.len());
    Ok(targets)
}
