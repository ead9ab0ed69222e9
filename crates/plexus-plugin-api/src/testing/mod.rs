//! Testing utilities for plugin and host developers
//!
//! Mock plugins with a shared call probe, static factories, and helpers that
//! lay artifacts out on disk the way the loader expects them.

pub mod helpers;
pub mod mocks;

pub use helpers::{artifact_extension, artifact_stem, write_artifact, write_artifact_with_stem, TestContext};
pub use mocks::{MockPlugin, MockPluginBuilder, MockProbe};
