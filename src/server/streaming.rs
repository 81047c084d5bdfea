//! NDJSON streaming for token-by-token chat responses.
//!
//! Converts a backend [`DeltaStream`] into Ollama's newline-delimited JSON
//! format: one `done: false` frame per delta, in arrival order, followed by a
//! single `done: true` frame. Each frame is yielded as its own body chunk so
//! hyper writes it out immediately.

use std::convert::Infallible;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::DeltaStream;
use crate::error::ErrorBody;
use crate::server::ollama_api::{ChatResponse, DoneSummary, DEFAULT_FINISH_REASON};

/// Serialize one frame followed by `\n`.
pub fn encode_frame<T: Serialize>(frame: &T) -> Bytes {
    let mut out = serde_json::to_vec(frame).unwrap_or_default();
    out.push(b'\n');
    Bytes::from(out)
}

enum Phase {
    /// Relaying backend deltas.
    Streaming { deltas: DeltaStream },
    /// Terminal frame or error frame already sent.
    Finished,
}

struct RelayState {
    phase: Phase,
    model: String,
    request_id: String,
    force_close: CancellationToken,
    last_finish_reason: Option<String>,
    frames: usize,
}

impl Drop for RelayState {
    fn drop(&mut self) {
        // Dropping the phase drops the backend stream and its connection.
        if matches!(self.phase, Phase::Streaming { .. }) {
            info!(
                request_id = self.request_id,
                frames = self.frames,
                "Client disconnected mid-stream, closing backend stream"
            );
        }
    }
}

/// Relay `deltas` as NDJSON frames for `model`.
///
/// A backend error mid-stream produces one `{"error": ...}` line and ends the
/// body without a `done: true` frame. The backend stream is dropped as soon
/// as it ends, fails, or the client goes away. Cancelling `force_close`
/// ends the body early, also without a `done: true` frame.
pub fn ndjson_chat_stream(
    deltas: DeltaStream,
    model: String,
    request_id: String,
    force_close: CancellationToken,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    let state = RelayState {
        phase: Phase::Streaming { deltas },
        model,
        request_id,
        force_close,
        last_finish_reason: None,
        frames: 0,
    };

    stream::unfold(state, |mut st| async move {
        let Phase::Streaming { deltas } = &mut st.phase else {
            return None;
        };

        let next = tokio::select! {
            biased;
            _ = st.force_close.cancelled() => None,
            next = deltas.next() => Some(next),
        };
        let Some(next) = next else {
            warn!(
                request_id = st.request_id,
                frames = st.frames,
                "Server shutting down, cutting stream short"
            );
            st.phase = Phase::Finished;
            return None;
        };

        match next {
            Some(Ok(delta)) => {
                if let Some(reason) = delta.finish_reason.filter(|r| !r.is_empty()) {
                    st.last_finish_reason = Some(reason);
                }
                st.frames += 1;
                let frame = encode_frame(&ChatResponse::partial(&st.model, delta.content));
                Some((Ok(frame), st))
            }
            Some(Err(e)) => {
                error!(request_id = st.request_id, error = %e, "Backend stream error");
                st.phase = Phase::Finished;
                let frame = encode_frame(&ErrorBody::new(format!("Stream error: {e}")));
                Some((Ok(frame), st))
            }
            None => {
                st.phase = Phase::Finished;
                let finish_reason = st
                    .last_finish_reason
                    .take()
                    .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string());
                debug!(
                    request_id = st.request_id,
                    frames = st.frames,
                    finish_reason = %finish_reason,
                    "Backend stream finished"
                );
                let frame = encode_frame(&ChatResponse::finished(
                    &st.model,
                    "",
                    DoneSummary::finished(finish_reason),
                ));
                Some((Ok(frame), st))
            }
        }
    })
}
