//! Kaleido: multi-display GPU camera-effects frame engine
//!
//! Imports externally-owned frame buffers, runs a configurable effect stack
//! on the GPU, presents to up to three displays in lockstep, and can divert
//! frames into a bounded capture buffer for animated-image export.

pub mod capture;
pub mod encode;
pub mod engine;
pub mod frame;
pub mod gpu;
pub mod output;
pub mod render;
pub mod source;
pub mod stats;
pub mod sync;
