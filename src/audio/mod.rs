//! Audio decode, output context and the playback engine.

pub mod buffer;
pub mod context;
pub mod decode;
pub mod engine;

pub use buffer::SampleBuffer;
pub use context::{list_output_devices, rodio_factory, AudioBackend, AudioContext, BackendFactory, PlaybackNode};
pub use decode::Decoder;
pub use engine::{EngineState, PlaybackEngine, PlaybackNotice, PlaybackSnapshot};
