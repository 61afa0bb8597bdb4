//! Frame dispatch: `(session, frame) -> session`.
//!
//! The reducer knows nothing about transport. It only checks that the frame
//! belongs to the query the session is currently attached to, then applies
//! the frame's effect.

use tracing::{debug, trace};

use crate::frame::Frame;
use crate::ids::QueryId;
use crate::session::{Phase, Session};

/// What happened to a dispatched frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The frame came from a query that no longer owns the session.
    Stale,
    /// Tag carried no effect for this client.
    Ignored,
}

/// Apply one frame to a session and return the next session state.
pub fn dispatch(mut session: Session, origin: &QueryId, frame: &Frame) -> (Session, Outcome) {
    if !session.is_active(origin) {
        debug!(
            session_id = %session.id,
            query_id = %origin,
            tag = frame.tag(),
            "dropping frame from inactive query"
        );
        return (session, Outcome::Stale);
    }

    match frame {
        Frame::Searching => {
            session.searching = true;
            session.phase = Phase::Searching;
        }
        Frame::Seeds(seeds) => {
            session.seeds = seeds.clone();
        }
        Frame::AnswerDelta(delta) => {
            session.response.push_str(delta);
            session.phase = Phase::Streaming;
        }
        Frame::AnswerComplete(answer) => {
            session.response = answer.clone();
            session.phase = Phase::Streaming;
        }
        Frame::Unknown { tag } => {
            trace!(session_id = %session.id, tag = %tag, "ignoring unknown frame");
            return (session, Outcome::Ignored);
        }
    }

    session.touch();
    (session, Outcome::Applied)
}
