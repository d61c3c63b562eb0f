//! Recurrent state carried from one rendered frame to the next.

use crate::tensor::Tensor;

/// The four hidden tensors of one frame together with that frame's time.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    time: f64,
    tensors: [Tensor; 4],
}

impl RecurrentState {
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn tensors(&self) -> &[Tensor; 4] {
        &self.tensors
    }
}

/// Outcome of asking the cache about a frame.
#[derive(Debug, Clone, Copy)]
pub enum StateLookup<'a> {
    /// Same frame or the next one: feed the stored state back in.
    Reuse(&'a RecurrentState),
    /// No usable state: run the model without recurrent inputs.
    ColdStart,
}

impl<'a> StateLookup<'a> {
    pub fn is_reusable(&self) -> bool {
        matches!(self, StateLookup::Reuse(_))
    }

    pub fn tensors(&self) -> Option<&'a [Tensor; 4]> {
        match self {
            StateLookup::Reuse(state) => Some(&state.tensors),
            StateLookup::ColdStart => None,
        }
    }
}

/// Single-slot cache of the last frame's recurrent state.
///
/// Holds either a complete state for one frame time or nothing.
#[derive(Debug, Default)]
pub struct RecurrentCache {
    state: Option<RecurrentState>,
}

impl RecurrentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// State usable for rendering `time`.
    ///
    /// Only a replay of the stored frame or a single step forward keeps the
    /// temporal memory; any jump starts cold.
    pub fn state_for(&self, time: f64) -> StateLookup<'_> {
        match &self.state {
            Some(state) if time == state.time || time == state.time + 1.0 => {
                StateLookup::Reuse(state)
            }
            _ => StateLookup::ColdStart,
        }
    }

    /// Replace whatever is stored with the state produced at `time`.
    pub fn record(&mut self, time: f64, tensors: [Tensor; 4]) {
        self.state = Some(RecurrentState { time, tensors });
    }

    pub fn clear(&mut self) {
        if self.state.take().is_some() {
            tracing::debug!("Recurrent history cleared");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    /// Time of the stored state, if any.
    pub fn time(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.time)
    }
}
