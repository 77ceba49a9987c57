//! Pulling blocks out of a synchronised block decoder.
//!
//! The decoder reports out-of-band events through its status: while [Status::EVENT_PENDING] is
//! set, events must be fetched before another block can be. The engine also reports the end of
//! the stream in two different ways: as a status flag after fetching an event, and as an error
//! code after fetching a block. Both are normalised here into `Ok(None)`.

use crate::{
    block::Block,
    engine::{BlockDecoder, DecodeEngine, RawBlock},
    errors::PtBlockError,
    session::DecoderSession,
    status::Status,
};

/// Given a decoder and its last status, fetch and discard events until none are pending.
///
/// Returns the new decoder status. An event pending flag may reappear after each event, so we
/// loop until it clears (or an error occurs).
pub(crate) fn drain_events<D: BlockDecoder + ?Sized>(dec: &mut D, mut status: Status) -> Status {
    while status.event_pending() {
        status = dec.next_event();
    }
    status
}

/// Advance the decoder by one block, given its last status.
///
/// Returns the decoder's new status, which must be passed to the next call, alongside the
/// outcome: `Ok(Some(block))` for the next block, `Ok(None)` at the end of the stream. Once this
/// has returned `Ok(None)`, the returned status makes all further calls return `Ok(None)`
/// without consulting the decoder.
pub(crate) fn step<D: BlockDecoder + ?Sized>(
    dec: &mut D,
    status: Status,
) -> (Status, Result<Option<RawBlock>, PtBlockError>) {
    let status = drain_events(dec, status);
    if let Some(e) = status.error() {
        return (status, Err(PtBlockError::Decode(e)));
    } else if status.end_of_stream() {
        return (status, Ok(None));
    } else if status != Status::CLEAN {
        return (
            status,
            Err(PtBlockError::unexpected_status("draining events", status)),
        );
    }

    let (status, block) = dec.next_block();
    if status.is_eos_error() {
        // End of stream is flagged as an error in the case of a block fetch.
        return (Status::from_flags(Status::END_OF_STREAM), Ok(None));
    } else if let Some(e) = status.error() {
        return (status, Err(PtBlockError::Decode(e)));
    }
    // The status may now have an event pending. That's dealt with on the next call.

    if block.ninsn == 0 {
        return (
            status,
            Err(PtBlockError::Contract(format!(
                "empty block at 0x{:x}",
                block.ip
            ))),
        );
    }
    if block.truncated {
        // A truncated block straddles two regions of the code image.
        return (
            status,
            Err(PtBlockError::TruncatedBlock {
                first_instr: block.ip,
            }),
        );
    }
    (status, Ok(Some(block)))
}

/// Iterate over the blocks of a [DecoderSession].
///
/// If an error occurs, it is returned once and then the iterator is exhausted.
pub struct BlockIterator<'s, 'b, E: DecodeEngine> {
    session: &'s mut DecoderSession<'b, E>,
    done: bool,
}

impl<'s, 'b, E: DecodeEngine> BlockIterator<'s, 'b, E> {
    pub(crate) fn new(session: &'s mut DecoderSession<'b, E>) -> Self {
        Self {
            session,
            done: false,
        }
    }
}

impl<E: DecodeEngine> Iterator for BlockIterator<'_, '_, E> {
    type Item = Result<Block, PtBlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.session.next_block() {
            Ok(Some(b)) => Some(Ok(b)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                // This iterator is unusable now.
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
