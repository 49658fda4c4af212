//! JSON-RPC client for the analysis backend channel.

mod client;
mod codec;
mod pending;

pub(crate) use client::deadline_elapsed;
pub use client::{AnalysisFragment, AnalysisRequest, AnalysisStream, BackendEvent, RpcClient};
pub use codec::{FrameReader, FrameWriter};
