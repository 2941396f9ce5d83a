//! Native bridge between an app's playback logic and the OS now-playing
//! widget, head-unit navigation UI, and local-network capability probe.

pub mod artwork_cache;
pub mod channel;
pub mod executor;
pub mod media_surface;
pub mod navigation;
pub mod now_playing;
pub mod permission_probe;
pub mod persistence;
pub mod position_tracker;
pub mod protocol;
pub mod remote_commands;
pub mod scene_registry;
