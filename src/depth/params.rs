//! Block matcher parameters.
//!
//! Operators move raw controls within fixed ranges; the matcher needs
//! values with extra structure (odd window sizes, multiples of 16,
//! signed minimum disparity). [`ParameterStore`] keeps both sides and
//! derives the matcher-ready values when a control changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;
use thiserror::Error;

/// Offset applied to the min-disparity control so a non-negative slider
/// can express negative disparities.
pub const MIN_DISPARITY_OFFSET: i32 = 100;

/// The matcher works in whole multiples of this many disparities.
pub const DISPARITY_STEP: i32 = 16;

/// Smallest legal window for the block and pre-filter sizes.
pub const MIN_WINDOW: i32 = 5;

/// Errors raised by parameter handling.
#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("unknown parameter name {0:?}")]
    UnknownName(String),
    #[error("{id} value {value} outside control range {min}..={max}")]
    OutOfRange {
        id: ParameterId,
        value: i32,
        min: i32,
        max: i32,
    },
    #[error("settings file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ParameterError {
    /// True for errors caused by a bad name or value rather than I/O.
    pub fn is_invalid_parameter(&self) -> bool {
        matches!(self, Self::UnknownName(_) | Self::OutOfRange { .. })
    }
}

/// The tunable matcher controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterId {
    /// Matching window.
    BlockSize,
    /// Speckle region size.
    SpeckleWindowSize,
    /// Speckle disparity variation.
    SpeckleRange,
    /// Uniqueness margin.
    UniquenessRatio,
    /// Minimum texture.
    TextureThreshold,
    /// Search range.
    NumDisparities,
    /// Search offset.
    MinDisparity,
    /// Pre-filter clamp.
    PreFilterCap,
    /// Pre-filter window.
    PreFilterSize,
}

impl ParameterId {
    /// All controls, in the order they are presented to operators.
    pub const ALL: [ParameterId; 9] = [
        ParameterId::BlockSize,
        ParameterId::SpeckleWindowSize,
        ParameterId::SpeckleRange,
        ParameterId::UniquenessRatio,
        ParameterId::TextureThreshold,
        ParameterId::NumDisparities,
        ParameterId::MinDisparity,
        ParameterId::PreFilterCap,
        ParameterId::PreFilterSize,
    ];

    /// Name used in settings and control files.
    pub fn name(self) -> &'static str {
        match self {
            ParameterId::BlockSize => "SWS",
            ParameterId::SpeckleWindowSize => "SpeckleSize",
            ParameterId::SpeckleRange => "SpeckleRange",
            ParameterId::UniquenessRatio => "UniqRatio",
            ParameterId::TextureThreshold => "TxtrThrshld",
            ParameterId::NumDisparities => "NumofDisp",
            ParameterId::MinDisparity => "MinDisp",
            ParameterId::PreFilterCap => "PreFiltCap",
            ParameterId::PreFilterSize => "PreFiltSize",
        }
    }

    /// Looks up a control by its settings-file name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }

    /// Range of the raw control.
    pub fn range(self) -> RangeInclusive<i32> {
        match self {
            ParameterId::BlockSize => 0..=230,
            ParameterId::SpeckleWindowSize => 0..=300,
            ParameterId::SpeckleRange => 0..=40,
            ParameterId::UniquenessRatio => 0..=20,
            ParameterId::TextureThreshold => 0..=1000,
            ParameterId::NumDisparities => 0..=16,
            ParameterId::MinDisparity => 0..=200,
            ParameterId::PreFilterCap => 0..=63,
            ParameterId::PreFilterSize => 0..=255,
        }
    }

    /// Raw control value the store starts from.
    pub fn default_raw(self) -> i32 {
        match self {
            ParameterId::BlockSize => 29,
            ParameterId::SpeckleWindowSize => 0,
            ParameterId::SpeckleRange => 0,
            ParameterId::UniquenessRatio => 1,
            ParameterId::TextureThreshold => 500,
            ParameterId::NumDisparities => 5,
            ParameterId::MinDisparity => 100,
            ParameterId::PreFilterCap => 20,
            ParameterId::PreFilterSize => 5,
        }
    }

    /// Maps a raw control value to the value the matcher receives.
    pub fn derive(self, raw: i32) -> i32 {
        match self {
            ParameterId::BlockSize | ParameterId::PreFilterSize => {
                let v = raw.max(MIN_WINDOW);
                if v % 2 == 0 {
                    v + 1
                } else {
                    v
                }
            }
            ParameterId::NumDisparities => raw.max(1) * DISPARITY_STEP,
            ParameterId::MinDisparity => raw - MIN_DISPARITY_OFFSET,
            ParameterId::UniquenessRatio | ParameterId::PreFilterCap => raw.max(1),
            ParameterId::SpeckleWindowSize
            | ParameterId::SpeckleRange
            | ParameterId::TextureThreshold => raw,
        }
    }
}

impl std::fmt::Display for ParameterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw control values, one per [`ParameterId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawControls {
    values: [i32; 9],
}

impl RawControls {
    fn index(id: ParameterId) -> usize {
        id as usize
    }

    /// Returns the raw value of `id`.
    pub fn get(&self, id: ParameterId) -> i32 {
        self.values[Self::index(id)]
    }

    /// Sets a control, rejecting values outside its range.
    pub fn set(&mut self, id: ParameterId, value: i32) -> Result<(), ParameterError> {
        let range = id.range();
        if !range.contains(&value) {
            return Err(ParameterError::OutOfRange {
                id,
                value,
                min: *range.start(),
                max: *range.end(),
            });
        }
        self.values[Self::index(id)] = value;
        Ok(())
    }

    /// Iterates all controls in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (ParameterId, i32)> + '_ {
        ParameterId::ALL.into_iter().map(|id| (id, self.get(id)))
    }

    /// Parses a flat `name = value` record. Every name must be known and
    /// every value in range; names that are absent keep their defaults.
    pub fn from_record(record: &BTreeMap<String, i64>) -> Result<Self, ParameterError> {
        let mut controls = Self::default();
        for (name, &value) in record {
            let id = ParameterId::from_name(name)
                .ok_or_else(|| ParameterError::UnknownName(name.clone()))?;
            let value = i32::try_from(value).map_err(|_| ParameterError::OutOfRange {
                id,
                value: if value < 0 { i32::MIN } else { i32::MAX },
                min: *id.range().start(),
                max: *id.range().end(),
            })?;
            controls.set(id, value)?;
        }
        Ok(controls)
    }

    /// Returns the name to value record written to settings files.
    pub fn to_record(&self) -> BTreeMap<String, i64> {
        self.iter()
            .map(|(id, value)| (id.name().to_string(), value as i64))
            .collect()
    }

    /// Applies the derivation rules to every control.
    pub fn derive(&self) -> MatcherParameters {
        let d = |id: ParameterId| id.derive(self.get(id));
        MatcherParameters {
            block_size: d(ParameterId::BlockSize),
            pre_filter_size: d(ParameterId::PreFilterSize),
            pre_filter_cap: d(ParameterId::PreFilterCap),
            min_disparity: d(ParameterId::MinDisparity),
            num_disparities: d(ParameterId::NumDisparities),
            texture_threshold: d(ParameterId::TextureThreshold),
            uniqueness_ratio: d(ParameterId::UniquenessRatio),
            speckle_window_size: d(ParameterId::SpeckleWindowSize),
            speckle_range: d(ParameterId::SpeckleRange),
        }
    }
}

impl Default for RawControls {
    fn default() -> Self {
        let mut values = [0; 9];
        for id in ParameterId::ALL {
            values[id as usize] = id.default_raw();
        }
        Self { values }
    }
}

/// Matcher-ready values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherParameters {
    /// Matching window edge, odd and at least 5.
    pub block_size: i32,
    /// Pre-filter window edge, odd and at least 5.
    pub pre_filter_size: i32,
    /// Pre-filter output clamp, at least 1.
    pub pre_filter_cap: i32,
    /// Smallest disparity searched; may be negative.
    pub min_disparity: i32,
    /// Disparities searched, a positive multiple of 16.
    pub num_disparities: i32,
    /// Minimum texture for a match to count.
    pub texture_threshold: i32,
    /// Margin in percent by which the best match must win, at least 1.
    pub uniqueness_ratio: i32,
    /// Largest speckle region removed; 0 disables speckle filtering.
    pub speckle_window_size: i32,
    /// Maximum disparity variation within one speckle region.
    pub speckle_range: i32,
}

impl Default for MatcherParameters {
    fn default() -> Self {
        RawControls::default().derive()
    }
}

/// Raw controls, their derived matcher values and change tracking.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    raw: RawControls,
    derived: MatcherParameters,
    dirty: bool,
    force_refresh: bool,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(RawControls::default())
    }
}

impl ParameterStore {
    /// Creates a store and derives its initial matcher values.
    pub fn new(raw: RawControls) -> Self {
        let derived = raw.derive();
        Self {
            raw,
            derived,
            dirty: false,
            force_refresh: false,
        }
    }

    /// Returns the raw controls.
    pub fn raw(&self) -> &RawControls {
        &self.raw
    }

    /// The matcher values as of the last derivation pass.
    pub fn matcher_parameters(&self) -> &MatcherParameters {
        &self.derived
    }

    /// Returns true if the next `refresh()` will derive.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.force_refresh
    }

    /// Sets a raw control. Out-of-range values are rejected and leave the
    /// store unchanged.
    pub fn set_raw(&mut self, id: ParameterId, value: i32) -> Result<(), ParameterError> {
        if self.raw.get(id) == value {
            return Ok(());
        }
        self.raw.set(id, value)?;
        self.dirty = true;
        tracing::trace!(parameter = %id, value, "Control changed");
        Ok(())
    }

    /// Re-derives matcher values if a control changed since the last pass
    /// or a load is pending. Returns true if a derivation happened.
    pub fn refresh(&mut self) -> bool {
        if !self.dirty && !self.force_refresh {
            return false;
        }
        self.derived = self.raw.derive();
        self.dirty = false;
        self.force_refresh = false;
        tracing::debug!(parameters = ?self.derived, "Matcher parameters derived");
        true
    }

    /// Writes the raw controls as a flat `name = value` TOML record.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ParameterError> {
        let path = path.as_ref();
        let text = toml::to_string(&self.raw.to_record())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        tracing::info!(path = %path.display(), "Depth map settings saved");
        Ok(())
    }

    /// Replaces the raw controls with a saved record and schedules one
    /// forced derivation pass. On error the store is left unchanged.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), ParameterError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let record: BTreeMap<String, i64> = toml::from_str(&text)?;
        self.raw = RawControls::from_record(&record)?;
        self.force_refresh = true;
        tracing::info!(path = %path.display(), "Depth map settings loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults_match_fixed_depth_settings() {
        let params = MatcherParameters::default();
        assert_eq!(params.block_size, 29);
        assert_eq!(params.pre_filter_size, 5);
        assert_eq!(params.pre_filter_cap, 20);
        assert_eq!(params.min_disparity, 0);
        assert_eq!(params.num_disparities, 80);
        assert_eq!(params.texture_threshold, 500);
        assert_eq!(params.uniqueness_ratio, 1);
        assert_eq!(params.speckle_range, 0);
        assert_eq!(params.speckle_window_size, 0);
    }

    #[test]
    fn test_names_round_trip() {
        for id in ParameterId::ALL {
            assert_eq!(ParameterId::from_name(id.name()), Some(id));
            assert!(id.range().contains(&id.default_raw()));
        }
        assert_eq!(ParameterId::from_name("Bogus"), None);
    }

    #[test]
    fn test_derivation_table() {
        assert_eq!(ParameterId::BlockSize.derive(0), 5);
        assert_eq!(ParameterId::BlockSize.derive(4), 5);
        assert_eq!(ParameterId::BlockSize.derive(6), 7);
        assert_eq!(ParameterId::PreFilterSize.derive(255), 255);
        assert_eq!(ParameterId::NumDisparities.derive(0), 16);
        assert_eq!(ParameterId::NumDisparities.derive(3), 48);
        assert_eq!(ParameterId::MinDisparity.derive(0), -100);
        assert_eq!(ParameterId::UniquenessRatio.derive(0), 1);
        assert_eq!(ParameterId::PreFilterCap.derive(0), 1);
        assert_eq!(ParameterId::PreFilterCap.derive(31), 31);
        assert_eq!(ParameterId::SpeckleRange.derive(0), 0);
        assert_eq!(ParameterId::TextureThreshold.derive(700), 700);
    }

    proptest! {
        #[test]
        fn prop_window_sizes_odd_and_at_least_five(v in 0i32..=255) {
            for id in [ParameterId::BlockSize, ParameterId::PreFilterSize] {
                let d = id.derive(v);
                prop_assert!(d >= 5);
                prop_assert_eq!(d % 2, 1);
                prop_assert_eq!(id.derive(d), d);
            }
        }

        #[test]
        fn prop_num_disparities_positive_multiple_of_16(v in ParameterId::NumDisparities.range()) {
            let d = ParameterId::NumDisparities.derive(v);
            prop_assert!(d > 0);
            prop_assert_eq!(d % 16, 0);
        }

        #[test]
        fn prop_min_disparity_offset(v in ParameterId::MinDisparity.range()) {
            prop_assert_eq!(ParameterId::MinDisparity.derive(v), v - 100);
        }

        #[test]
        fn prop_save_then_load_reproduces_parameters(
            sws in ParameterId::BlockSize.range(),
            nod in ParameterId::NumDisparities.range(),
            mds in ParameterId::MinDisparity.range(),
            pfc in ParameterId::PreFilterCap.range(),
            ur in ParameterId::UniquenessRatio.range(),
        ) {
            let mut store = ParameterStore::default();
            store.set_raw(ParameterId::BlockSize, sws).unwrap();
            store.set_raw(ParameterId::NumDisparities, nod).unwrap();
            store.set_raw(ParameterId::MinDisparity, mds).unwrap();
            store.set_raw(ParameterId::PreFilterCap, pfc).unwrap();
            store.set_raw(ParameterId::UniquenessRatio, ur).unwrap();
            store.refresh();
            let active = *store.matcher_parameters();

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("settings.toml");
            store.save(&path).unwrap();

            let mut restored = ParameterStore::default();
            restored.load(&path).unwrap();
            prop_assert!(restored.refresh());
            prop_assert_eq!(*restored.matcher_parameters(), active);
            prop_assert_eq!(restored.raw(), store.raw());
        }
    }

    #[test]
    fn test_refresh_only_when_dirty() {
        let mut store = ParameterStore::default();
        assert!(!store.refresh());

        store.set_raw(ParameterId::BlockSize, 40).unwrap();
        assert!(store.is_dirty());
        // Not yet derived.
        assert_eq!(store.matcher_parameters().block_size, 29);

        assert!(store.refresh());
        assert_eq!(store.matcher_parameters().block_size, 41);
        assert!(!store.refresh());
    }

    #[test]
    fn test_setting_same_value_is_not_a_change() {
        let mut store = ParameterStore::default();
        store.set_raw(ParameterId::BlockSize, 29).unwrap();
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let mut store = ParameterStore::default();
        let err = store.set_raw(ParameterId::NumDisparities, 17).unwrap_err();
        assert!(err.is_invalid_parameter());
        assert_eq!(store.raw().get(ParameterId::NumDisparities), 5);
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_load_forces_exactly_one_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        ParameterStore::default().save(&path).unwrap();

        let mut store = ParameterStore::default();
        store.load(&path).unwrap();
        assert!(store.refresh());
        assert!(!store.refresh());
    }

    #[test]
    fn test_settings_file_is_flat_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        ParameterStore::default().save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("SWS = 29"));
        assert!(text.contains("MinDisp = 100"));
        assert!(text.contains("NumofDisp = 5"));
    }

    #[test]
    fn test_load_rejects_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "SWS = 31\nWindowSize = 9\n").unwrap();

        let mut store = ParameterStore::default();
        let err = store.load(&path).unwrap_err();
        assert!(matches!(err, ParameterError::UnknownName(ref n) if n == "WindowSize"));
        assert_eq!(store.raw(), &RawControls::default());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_load_rejects_out_of_range_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "PreFiltCap = 64\n").unwrap();

        let mut store = ParameterStore::default();
        assert!(store.load(&path).unwrap_err().is_invalid_parameter());
    }
}
