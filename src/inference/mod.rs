//! On-device inference: execution contract, loaded models and sessions

mod backend;
pub mod mock;
mod registry;
mod session;
mod simulated;
mod types;

pub use backend::{ExecutionBackend, GeneratedToken, LoadOptions, ModelHandle, TokenSource};
pub use registry::{LoadedModel, ModelLease, ModelRegistry};
pub use session::{CancelHandle, InferenceSession, SessionState};
pub use simulated::SimulatedBackend;
pub use types::{
    FinishReason, GenerationParams, InferenceRequest, InferenceResponse, StreamingToken, Timings,
};
