//! Disparity computation and visualization.
//!
//! Raw operator controls live in a [`ParameterStore`], which derives the
//! [`MatcherParameters`] handed to the [`DepthMapEngine`]. The engine
//! configures a [`StereoMatcher`], runs it on a rectified pair and turns
//! the result into a normalized map and a false-color image.

mod colormap;
mod engine;
mod matcher;
mod params;

pub use colormap::{apply_jet, jet};
pub use engine::{
    normalize, normalize_into, overlay, DepthMapEngine, DepthOutput, PRE_FILTER_TYPE,
};
pub use matcher::{
    BlockMatcher, DepthError, DisparityMap, MatcherConfig, PreFilterType, StereoMatcher,
    DISP_SCALE,
};
pub use params::{
    MatcherParameters, ParameterError, ParameterId, ParameterStore, RawControls,
    DISPARITY_STEP, MIN_DISPARITY_OFFSET, MIN_WINDOW,
};
