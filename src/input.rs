//! Operator input
//!
//! Keyboard events map onto calibrator actions: arrows nudge in x/y, `8`/`2`
//! nudge in z, space cycles the calibration mode, `+`/`-` adjust the
//! grid-select radius, Enter / Shift+Enter walk the display selection and
//! `a`/`d` walk the vertex cursor. The mapping itself is pure so it can be
//! tested without a terminal; only the read loop touches crossterm.

use anyhow::Result;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use nalgebra::Vector3;
use tokio::sync::mpsc;
use tracing::debug;

use crate::replicator::CalibrationMode;

/// One operator intent, decoded from a key press.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibratorAction {
    Nudge(Vector3<f32>),
    CycleMode,
    GrowSelection,
    ShrinkSelection,
    SelectNext,
    SelectPrevious,
    NextVertex,
    PreviousVertex,
    /// Attach the info overlay to the focused display. Issued by the
    /// deferred startup task rather than a key.
    FocusOverlay,
    Quit,
}

/// Per-mode nudge step. Vertex and position edits move in small mesh-space
/// steps; rotation moves in tenths of a degree.
pub fn delta_for_mode(mode: CalibrationMode) -> f32 {
    match mode {
        CalibrationMode::Vertex | CalibrationMode::Position => 0.0015,
        CalibrationMode::Rotation => 0.10,
    }
}

/// Decode a key event; `None` for keys the calibrator ignores.
pub fn action_for_key(key: &KeyEvent) -> Option<CalibratorAction> {
    let shifted = key.modifiers.contains(KeyModifiers::SHIFT);
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        // raw mode swallows the SIGINT, so ctrl-c arrives as a key
        return Some(CalibratorAction::Quit);
    }
    let action = match key.code {
        KeyCode::Right => CalibratorAction::Nudge(Vector3::new(1.0, 0.0, 0.0)),
        KeyCode::Left => CalibratorAction::Nudge(Vector3::new(-1.0, 0.0, 0.0)),
        KeyCode::Up => CalibratorAction::Nudge(Vector3::new(0.0, 1.0, 0.0)),
        KeyCode::Down => CalibratorAction::Nudge(Vector3::new(0.0, -1.0, 0.0)),
        KeyCode::Char('8') => CalibratorAction::Nudge(Vector3::new(0.0, 0.0, -1.0)),
        KeyCode::Char('2') => CalibratorAction::Nudge(Vector3::new(0.0, 0.0, 1.0)),
        KeyCode::Char(' ') => CalibratorAction::CycleMode,
        KeyCode::Char('+') => CalibratorAction::GrowSelection,
        KeyCode::Char('-') => CalibratorAction::ShrinkSelection,
        KeyCode::Enter => {
            if shifted {
                CalibratorAction::SelectPrevious
            } else {
                CalibratorAction::SelectNext
            }
        }
        KeyCode::Char('a') | KeyCode::Char('A') => CalibratorAction::PreviousVertex,
        KeyCode::Char('d') | KeyCode::Char('D') => CalibratorAction::NextVertex,
        KeyCode::Char('q') | KeyCode::Esc => CalibratorAction::Quit,
        _ => return None,
    };
    Some(action)
}

/// Blocking key-read loop for the authority node. Runs on a dedicated
/// blocking thread and feeds decoded actions into the update loop; returns
/// once the operator quits or the receiving side is gone.
pub fn run_key_loop(tx: mpsc::UnboundedSender<CalibratorAction>) -> Result<()> {
    crossterm::terminal::enable_raw_mode()?;
    let result = read_keys(&tx);
    crossterm::terminal::disable_raw_mode()?;
    result
}

fn read_keys(tx: &mpsc::UnboundedSender<CalibratorAction>) -> Result<()> {
    loop {
        if let Event::Key(key) = crossterm::event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let Some(action) = action_for_key(&key) else {
                continue;
            };
            debug!("operator action: {:?}", action);
            let quit = action == CalibratorAction::Quit;
            if tx.send(action).is_err() || quit {
                return Ok(());
            }
        }
    }
}
