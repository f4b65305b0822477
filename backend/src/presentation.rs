//! Presentation Pipeline Module
//!
//! Handles frame output. Headless mode renders to texture only and
//! signals a frame event that streaming consumers block on; windowed mode
//! would own a swap chain and is represented here at the same interface.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

/// Presentation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationMode {
    /// Render to texture only (for streaming tools)
    Headless,
    /// Create a window and present frames
    Windowed,
    /// Both headless and windowed
    Dual,
}

#[derive(Debug, Clone)]
pub struct PresentationConfig {
    pub mode: PresentationMode,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub buffer_count: u32,
}

/// Manages frame presentation
pub struct PresentationPipeline {
    config: PresentationConfig,
    frame_event: FrameEvent,
}

/// Event a streaming consumer blocks on; carries the presented-frame
/// counter so a slow consumer can detect skipped frames.
struct FrameEvent {
    count: Mutex<u64>,
    condvar: Condvar,
}

impl PresentationPipeline {
    pub fn new(config: PresentationConfig) -> Result<Self> {
        info!(
            mode = ?config.mode,
            width = config.width,
            height = config.height,
            vsync = config.vsync,
            buffers = config.buffer_count,
            "creating presentation pipeline"
        );
        Ok(Self {
            config,
            frame_event: FrameEvent {
                count: Mutex::new(0),
                condvar: Condvar::new(),
            },
        })
    }

    /// Present a frame from the given backbuffer.
    pub fn present(&mut self, backbuffer_id: u32, sync_interval: u32) -> Result<()> {
        debug!(backbuffer_id, sync_interval, "presenting frame");
        let mut count = self
            .frame_event
            .count
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *count += 1;
        self.frame_event.condvar.notify_all();
        Ok(())
    }

    /// Block until a frame newer than `seen` is presented; returns the new
    /// frame counter, or `None` on timeout.
    pub fn wait_frame(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let mut count = self
            .frame_event
            .count
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *count <= seen {
            let (c, result) = self
                .frame_event
                .condvar
                .wait_timeout_while(count, timeout, |c| *c <= seen)
                .unwrap_or_else(|e| e.into_inner());
            count = c;
            if result.timed_out() && *count <= seen {
                return None;
            }
        }
        Some(*count)
    }

    /// Frames presented so far.
    pub fn frame_count(&self) -> u64 {
        *self
            .frame_event
            .count
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Resize the presentation surface: quiesce, rebuild the swap chain
    /// at the new dimensions.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        info!(width, height, "resizing presentation");
        self.config.width = width;
        self.config.height = height;
        Ok(())
    }

    /// Get current dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    /// Get the presentation mode.
    pub fn mode(&self) -> PresentationMode {
        self.config.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pipeline() -> PresentationPipeline {
        PresentationPipeline::new(PresentationConfig {
            mode: PresentationMode::Headless,
            width: 1920,
            height: 1080,
            vsync: true,
            buffer_count: 2,
        })
        .unwrap()
    }

    #[test]
    fn present_signals_frame_event() {
        let mut p = pipeline();
        assert_eq!(p.frame_count(), 0);
        p.present(1, 1).unwrap();
        p.present(1, 1).unwrap();
        assert_eq!(p.frame_count(), 2);
        assert_eq!(p.wait_frame(0, Duration::from_millis(1)), Some(2));
        assert_eq!(p.wait_frame(2, Duration::from_millis(1)), None);
    }

    #[test]
    fn resize_updates_dimensions() {
        let mut p = pipeline();
        p.resize(1280, 720).unwrap();
        assert_eq!(p.dimensions(), (1280, 720));
    }
}
