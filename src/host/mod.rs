//! The host side of a render: clip images fetched for a frame and handed
//! back when the render is over.

mod memory;

pub use memory::{MemoryHost, MemoryImage};

use std::ops::{Deref, DerefMut};

use crate::instance::Clip;
use crate::pixels::{PixelBufferView, PixelBufferViewMut, PixelError};

/// An image the host lent out for one render call.
pub trait ClipImage {
    /// Read access to the pixels; fails when the host format is unsupported.
    fn view(&self) -> Result<PixelBufferView<'_>, PixelError>;

    /// Write access to the pixels.
    fn view_mut(&mut self) -> Result<PixelBufferViewMut<'_>, PixelError>;
}

/// Services the host provides to an effect instance.
///
/// Injected at construction; every image fetched through it is released
/// before the render call returns.
pub trait ClipProvider {
    type Image: ClipImage;

    /// Image of `clip` at `time`, `None` when the host has nothing to give.
    fn fetch(&self, clip: Clip, time: f64) -> Option<Self::Image>;

    /// Give an image back to the host.
    fn release(&self, image: Self::Image);

    /// Ask the host to abort the current render. Returns whether the host
    /// accepted.
    fn abort(&self) -> bool;
}

/// Fetched image released back to its host on drop.
pub struct ClipGuard<'h, P: ClipProvider> {
    host: &'h P,
    clip: Clip,
    image: Option<P::Image>,
}

impl<'h, P: ClipProvider> ClipGuard<'h, P> {
    /// Fetch `clip` at `time`; `None` when unavailable.
    pub fn fetch(host: &'h P, clip: Clip, time: f64) -> Option<Self> {
        let image = host.fetch(clip, time)?;
        Some(Self {
            host,
            clip,
            image: Some(image),
        })
    }

    pub fn clip(&self) -> Clip {
        self.clip
    }
}

impl<P: ClipProvider> Deref for ClipGuard<'_, P> {
    type Target = P::Image;

    fn deref(&self) -> &Self::Target {
        // Only `drop` empties the slot.
        self.image.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<P: ClipProvider> DerefMut for ClipGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.image.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<P: ClipProvider> Drop for ClipGuard<'_, P> {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            tracing::trace!(clip = %self.clip, "Releasing clip image");
            self.host.release(image);
        }
    }
}
