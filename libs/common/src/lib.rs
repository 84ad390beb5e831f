//! Common utilities for Conflux
//!
//! Provides shared configuration loading and telemetry.

pub mod settings;
pub mod telemetry;

pub use settings::{load_settings, SettingsError};
pub use telemetry::{init_tracing, init_tracing_as, LogFormat};
