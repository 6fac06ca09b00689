#[macro_use]
extern crate tracing;
pub mod capacity;
pub mod control_plane;
pub mod options;
pub mod provision;
pub mod readiness;
pub mod settings;
pub mod snapshot;
pub mod structs;

pub use settings::{load_settings, Settings};
