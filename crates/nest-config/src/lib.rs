// ABOUTME: nest-config library with settings loading and snapshotting.
// ABOUTME: Re-exports Settings, Mode, and the snapshot writer.

mod settings;
mod snapshot;

pub use settings::{Mode, Settings, SettingsError};
pub use snapshot::write_settings_snapshot;
