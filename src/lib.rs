//! Recurrent video matting render core.
//!
//! Host pixel buffers go through [`pixels`] into tensors, a recurrent model
//! owned by a [`model::ModelRegistry`] estimates foreground and alpha, the
//! [`recurrent::RecurrentCache`] carries hidden state between consecutive
//! frames and [`engine::MattingEngine`] composites the result back into the
//! host's output buffer.

pub mod engine;
pub mod host;
pub mod instance;
pub mod model;
pub mod pixels;
pub mod recurrent;
pub mod sequence;
pub mod tensor;

pub use engine::{FrameDescriptor, MattingEngine, RenderError, Status};
pub use instance::{EffectConfig, InstanceState};
pub use model::ModelRegistry;
