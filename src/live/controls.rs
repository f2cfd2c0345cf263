//! Operator controls for the tuning loop.

use super::LiveError;
use crate::depth::{ParameterId, RawControls};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Set a raw control to a new position.
    Set(ParameterId, i32),
    /// Write the current raw controls to the settings file.
    Save,
    /// Replace the raw controls from the settings file.
    Load,
    /// Re-read the calibration store.
    ReloadCalibration,
}

/// Source of operator actions, polled once per loop iteration.
pub trait ControlPanel {
    /// Returns the actions since the previous poll, in order.
    fn poll(&mut self) -> Vec<ControlEvent>;
}

const FLAGS: [(&str, ControlEvent); 3] = [
    ("save", ControlEvent::Save),
    ("load", ControlEvent::Load),
    ("reload_calibration", ControlEvent::ReloadCalibration),
];

/// Control panel backed by a TOML file the operator edits.
///
/// The file holds the nine controls by settings name plus the `save`,
/// `load` and `reload_calibration` flags. It is read on every poll and
/// parsed only when its contents differ from the last read, so edits
/// landing within one timestamp tick are still seen. A control emits `Set` when its value
/// differs from the last one read; a flag fires when it goes from 0 to 1.
#[derive(Debug)]
pub struct FileControlPanel {
    path: PathBuf,
    contents: Option<String>,
    values: BTreeMap<ParameterId, i32>,
    flags: [bool; FLAGS.len()],
}

impl FileControlPanel {
    /// Watches the control file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            contents: None,
            values: BTreeMap::new(),
            flags: [false; FLAGS.len()],
        }
    }

    /// Returns the control file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a control file holding `raw` with every flag cleared.
    pub fn write_template(path: impl AsRef<Path>, raw: &RawControls) -> Result<(), LiveError> {
        let mut text = String::from("# Edit and save to apply. Set a flag to 1 to trigger it.\n");
        for (id, value) in raw.iter() {
            text.push_str(&format!("{} = {}\n", id.name(), value));
        }
        for (name, _) in FLAGS {
            text.push_str(&format!("{name} = 0\n"));
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    fn read_table(&mut self) -> Option<toml::Table> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Control file unreadable");
                return None;
            }
        };
        if self.contents.as_deref() == Some(text.as_str()) {
            return None;
        }
        let parsed = text.parse::<toml::Table>();
        self.contents = Some(text);
        match parsed {
            Ok(table) => Some(table),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Control file ignored");
                None
            }
        }
    }
}

impl ControlPanel for FileControlPanel {
    fn poll(&mut self) -> Vec<ControlEvent> {
        let Some(table) = self.read_table() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let mut raised = [false; FLAGS.len()];

        for (key, value) in &table {
            let Some(value) = value.as_integer() else {
                tracing::warn!(key = %key, "Control value is not an integer");
                continue;
            };
            if let Some(slot) = FLAGS.iter().position(|(name, _)| *name == key.as_str()) {
                raised[slot] = value != 0;
                continue;
            }
            let Some(id) = ParameterId::from_name(key) else {
                tracing::warn!(key = %key, "Unknown control");
                continue;
            };
            let Ok(value) = i32::try_from(value) else {
                tracing::warn!(key = %key, value, "Control value out of range");
                continue;
            };
            if self.values.insert(id, value) != Some(value) {
                events.push(ControlEvent::Set(id, value));
            }
        }

        for (slot, (_, event)) in FLAGS.iter().enumerate() {
            if raised[slot] && !self.flags[slot] {
                events.push(*event);
            }
            self.flags[slot] = raised[slot];
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    /// Rewrites the file with a strictly later modification time.
    fn rewrite(path: &Path, text: &str) {
        let before = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        std::fs::write(path, text).unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        let bumped = before.unwrap_or(SystemTime::now()) + Duration::from_secs(1);
        file.set_modified(bumped).unwrap();
    }

    #[test]
    fn test_missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut panel = FileControlPanel::new(dir.path().join("controls.toml"));
        assert!(panel.poll().is_empty());
    }

    #[test]
    fn test_template_emits_all_controls_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controls.toml");
        FileControlPanel::write_template(&path, &RawControls::default()).unwrap();

        let mut panel = FileControlPanel::new(&path);
        let events = panel.poll();
        assert_eq!(events.len(), ParameterId::ALL.len());
        assert!(events.contains(&ControlEvent::Set(ParameterId::BlockSize, 29)));

        // Unchanged contents: nothing new.
        assert!(panel.poll().is_empty());
    }

    #[test]
    fn test_changed_value_emits_single_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controls.toml");
        std::fs::write(&path, "SWS = 29\nNumofDisp = 5\n").unwrap();

        let mut panel = FileControlPanel::new(&path);
        assert_eq!(panel.poll().len(), 2);

        rewrite(&path, "SWS = 41\nNumofDisp = 5\n");
        assert_eq!(panel.poll(), vec![ControlEvent::Set(ParameterId::BlockSize, 41)]);
    }

    #[test]
    fn test_flag_fires_on_rising_edge_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controls.toml");
        std::fs::write(&path, "save = 0\nload = 0\n").unwrap();

        let mut panel = FileControlPanel::new(&path);
        assert!(panel.poll().is_empty());

        rewrite(&path, "save = 1\nload = 0\n");
        assert_eq!(panel.poll(), vec![ControlEvent::Save]);

        // Still raised: no second event.
        rewrite(&path, "save = 1\nload = 0\n# touched\n");
        assert!(panel.poll().is_empty());

        rewrite(&path, "save = 0\nload = 1\n");
        assert_eq!(panel.poll(), vec![ControlEvent::Load]);

        rewrite(&path, "save = 1\nload = 1\nreload_calibration = 1\n");
        assert_eq!(
            panel.poll(),
            vec![ControlEvent::Save, ControlEvent::ReloadCalibration]
        );
    }

    #[test]
    fn test_bad_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controls.toml");
        std::fs::write(&path, "Bogus = 3\nSWS = \"wide\"\nMinDisp = 120\n").unwrap();

        let mut panel = FileControlPanel::new(&path);
        assert_eq!(panel.poll(), vec![ControlEvent::Set(ParameterId::MinDisparity, 120)]);
    }

    #[test]
    fn test_same_size_edit_with_unchanged_timestamp_is_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controls.toml");
        std::fs::write(&path, "save = 0
SWS = 29
").unwrap();
        let stamp = std::fs::metadata(&path).unwrap().modified().unwrap();

        let mut panel = FileControlPanel::new(&path);
        assert_eq!(panel.poll(), vec![ControlEvent::Set(ParameterId::BlockSize, 29)]);

        std::fs::write(&path, "save = 1
SWS = 31
").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(stamp).unwrap();
        drop(file);

        assert_eq!(
            panel.poll(),
            vec![ControlEvent::Set(ParameterId::BlockSize, 31), ControlEvent::Save]
        );
        assert!(panel.poll().is_empty());
    }
}
