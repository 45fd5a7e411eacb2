//! Optional live-viewer side channel.
//!
//! The trainer polls the channel between iterations without blocking. A
//! render request is answered with the current model seen from the requested
//! camera; a failed exchange only resets the channel. On the last iteration
//! a `keep_alive` viewer is served until it disconnects.

use gs_core::{Camera, Image};

use crate::Result;

#[derive(Debug, Clone)]
pub struct ViewerRequest {
    /// Pose and resolution to render. Its target image is ignored.
    pub camera: Camera,
    pub scaling_modifier: f32,
    /// Resume training after answering. When false the trainer keeps
    /// answering requests until the channel goes idle.
    pub do_training: bool,
    /// Hold the final iteration open and keep serving until the viewer
    /// disconnects or stops asking for it.
    pub keep_alive: bool,
}

#[derive(Debug, Clone)]
pub enum ViewerPoll {
    Idle,
    Render(Box<ViewerRequest>),
    Disconnected,
}

pub trait ViewerChannel: Send {
    fn poll(&mut self) -> ViewerPoll;

    fn send(&mut self, image: &Image) -> Result<()>;

    /// Drops the connection state after an error or disconnect.
    fn reset(&mut self);
}

/// A channel that never has a viewer attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoViewer;

impl ViewerChannel for NoViewer {
    fn poll(&mut self) -> ViewerPoll {
        ViewerPoll::Idle
    }

    fn send(&mut self, _image: &Image) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {}
}
