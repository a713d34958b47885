//! Token-by-token decode loop over a [`DecodeSession`].

use tokio_util::sync::CancellationToken;

use super::DecodeSession;
use crate::engine::{EngineError, FinishReason};

/// What the loop does after a piece has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceAction {
    Continue,
    Stop,
}

/// Generate up to `max_tokens` tokens, handing each text piece to `on_piece`.
///
/// Cancellation is checked before every step and surfaces as
/// [`EngineError::Timeout`]. Empty pieces are not delivered. The prompt
/// batch has already been decoded by the session.
pub fn run_decode_loop<F>(
    session: &mut dyn DecodeSession,
    max_tokens: u32,
    cancel: &CancellationToken,
    mut on_piece: F,
) -> Result<FinishReason, EngineError>
where
    F: FnMut(String) -> Result<PieceAction, EngineError>,
{
    for _ in 0..max_tokens {
        if cancel.is_cancelled() {
            return Err(EngineError::Timeout);
        }

        let token = session.sample();
        if session.is_end_of_sequence(token) {
            return Ok(FinishReason::EndOfSequence);
        }

        let piece = session.token_to_piece(token)?;
        if !piece.is_empty() && on_piece(piece)? == PieceAction::Stop {
            return Ok(FinishReason::Stopped);
        }

        session.feed(token)?;
    }
    Ok(FinishReason::MaxTokens)
}
