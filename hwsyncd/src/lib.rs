//! Hardware Synchronization Daemon Library
//!
//! This library provides the core functionality for the hwsync daemon:
//! - Periodic worker scheduling
//! - Keyboard backlight discovery and bidirectional synchronization
//! - Display mode discovery and control for X11 sessions
//! - IPC communication

use std::sync::Arc;
use std::time::Instant;

pub mod backlight;
pub mod config;
pub mod display;
pub mod ipc;
pub mod leds;
pub mod power;
pub mod settings;
pub mod worker;

// Re-export common types
pub use hwsync_common::{BacklightCapabilities, BacklightZoneState, DisplayMode, DisplayModesReport};

/// DaemonState holds what the IPC layer exposes to clients
pub struct DaemonState {
    pub start_time: Instant,
    pub backlight: backlight::BacklightHandle,
    pub display: Arc<display::DisplayController>,
}

impl DaemonState {
    pub fn new(backlight: backlight::BacklightHandle, display: Arc<display::DisplayController>) -> Self {
        Self {
            start_time: Instant::now(),
            backlight,
            display,
        }
    }
}
