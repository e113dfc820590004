pub mod lifecycle;

pub use lifecycle::{
    CallbackResolution, GenerationError, GenerationManager, GenerationTracker, NewGeneration,
};
