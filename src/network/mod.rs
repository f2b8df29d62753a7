//! C7 — per-link coded transport (spec §4.6): the `Handler` that
//! multiplexes a flow channel and per-digest side channels over one
//! fountain-coded, congestion-controlled raw transport, plus the frame
//! format and congestion math it runs on.

pub mod congestion;
pub mod frame;
pub mod handler;

use thiserror::Error;

pub use congestion::CongestionState;
pub use frame::{Channel, FrameError, HandlerFrame};
pub use handler::{Handler, HandlerError, RawTransport};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}
