//! Camera capture-and-encode daemon.
//!
//! This crate captures frames from an image sensor, compresses them to H.264
//! (plus an optional low-rate JPEG stream) and streams the result to a parent
//! process over a pipe, accepting live parameter updates.
//!
//! # Architecture
//!
//! Frames flow one way, leaf modules first:
//!
//! 1. **Buffers**: DMA-heap regions shared with the capture hardware by fd.
//! 2. **Capture**: a fixed pool of requests, recycled on every completion.
//! 3. **Encoding**: a hardware M2M encoder fed by fd, or libx264 fed by copy.
//! 4. **Transport**: length-prefixed messages to the parent process.
//!
//! # Module Structure
//!
//! - `buffer`: DMA heap allocator, mapped buffers, CPU-access sync
//! - `camera`: capture session, camera devices, controls, decimation
//! - `encoder`: backend selection, hardware and software H.264
//! - `jpeg`: secondary stream JPEG encoder
//! - `params`: parameter snapshots and their wire format
//! - `pipe`: control-plane framing
//! - `router`: wiring between capture, encoders and the pipe
//! - `text`: timestamp overlay drawn into primary frames
//! - `config`: host settings for `camerad`

pub mod buffer;
pub mod camera;
pub mod config;
pub mod encoder;
pub mod jpeg;
pub mod mailbox;
pub mod params;
pub mod pipe;
pub mod router;
mod sys;
pub mod text;

pub use buffer::{BufferAllocator, DmaBuffer, DEFAULT_HEAPS, MEMFD_HEAP};
pub use camera::{CaptureSession, Frame};
pub use config::DaemonConfig;
pub use encoder::{Encoder, EncoderOptions, OutputCallback};
pub use params::Parameters;
pub use pipe::{Command, CommandReader, PipeWriter};
pub use router::Router;
