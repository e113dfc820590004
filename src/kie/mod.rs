pub mod callback;
pub mod client;
pub mod models;

pub use callback::{parse_callback, CallbackEvent, CallbackOutcome};
pub use client::{GenerationRequest, KieClient, ProviderError, VideoProvider};
pub use models::VideoModel;
