//! Query orchestration: validate, attach, read, dispatch, settle.
//!
//! Each session has at most one live reader. Submitting a new query for a
//! session cancels the previous reader before the new one starts; the
//! dispatcher's query-id guard drops anything the old reader still delivers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use quarry_client::KnowledgeBackend;
use quarry_core::config::QueryConfig;
use quarry_core::dispatch::{dispatch, Outcome};
use quarry_core::errors::TransportError;
use quarry_core::frame::Frame;
use quarry_core::ids::{QueryId, SessionId};
use quarry_core::messages::Message;
use quarry_core::session::Session;
use quarry_store::{SessionStore, StoreError};

use crate::error::QueryError;

/// Whether a session currently has a query in flight.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryState {
    pub in_flight: bool,
    pub query_id: Option<QueryId>,
}

struct ActiveQuery {
    query_id: QueryId,
    cancel: CancellationToken,
    aborted: Arc<AtomicBool>,
}

/// One running query, as seen by its own reader.
struct Run<'a> {
    session_id: &'a SessionId,
    query_id: &'a QueryId,
    cancel: &'a CancellationToken,
    aborted: &'a AtomicBool,
}

impl Run<'_> {
    /// Why the reader had to stop without settling.
    fn interrupted(&self) -> QueryError {
        if self.aborted.load(Ordering::SeqCst) {
            QueryError::Aborted
        } else {
            QueryError::Superseded
        }
    }
}

pub struct QueryOrchestrator {
    backend: Arc<dyn KnowledgeBackend>,
    sessions: Arc<dyn SessionStore>,
    active: DashMap<SessionId, ActiveQuery>,
}

impl QueryOrchestrator {
    pub fn new(backend: Arc<dyn KnowledgeBackend>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            backend,
            sessions,
            active: DashMap::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Append `messages` to the session and run one query to completion.
    ///
    /// Returns the settled session. Transport and protocol failures settle
    /// the session in Error (partial output kept) and are returned as well.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn submit_query(
        &self,
        session_id: &SessionId,
        messages: Vec<Message>,
        config: &QueryConfig,
    ) -> Result<Session, QueryError> {
        config.validate(&messages)?;
        self.sessions
            .get(session_id)
            .map_err(|_| QueryError::SessionNotFound(session_id.clone()))?;

        let query_id = QueryId::new();
        let cancel = CancellationToken::new();
        let aborted = Arc::new(AtomicBool::new(false));
        let session = self.attach(session_id, &query_id, messages, &cancel, &aborted)?;
        let _release = Release {
            orchestrator: self,
            session_id,
            query_id: &query_id,
        };

        info!(query_id = %query_id, stream = config.stream, history = session.messages.len(), "query started");
        let run = Run {
            session_id,
            query_id: &query_id,
            cancel: &cancel,
            aborted: &aborted,
        };
        let result = if config.stream {
            self.run_stream(&run, &session.messages, config).await
        } else {
            self.run_single(&run, &session.messages, config).await
        };

        match &result {
            Ok(settled) => info!(
                query_id = %query_id,
                response_len = settled.response.len(),
                seeds = settled.seeds.len(),
                "query settled"
            ),
            Err(QueryError::Superseded) => debug!(query_id = %query_id, "query superseded"),
            Err(e) => warn!(query_id = %query_id, error_kind = e.error_kind(), error = %e, "query failed"),
        }
        result
    }

    /// Cancel the in-flight query and settle the session in Error with the
    /// partial output kept. Returns whether a query was in flight.
    pub fn abort(&self, session_id: &SessionId) -> bool {
        let Some((_, run)) = self.active.remove(session_id) else {
            return false;
        };
        run.aborted.store(true, Ordering::SeqCst);
        run.cancel.cancel();
        self.fail(session_id, &run.query_id, "aborted", "query aborted");
        info!(session_id = %session_id, query_id = %run.query_id, "query aborted");
        true
    }

    pub fn abort_all(&self) -> usize {
        let ids: Vec<SessionId> = self.active.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.abort(id)).count()
    }

    pub fn state(&self, session_id: &SessionId) -> QueryState {
        match self.active.get(session_id) {
            Some(run) => QueryState {
                in_flight: true,
                query_id: Some(run.query_id.clone()),
            },
            None => QueryState::default(),
        }
    }

    /// Register the new reader and attach the query to the session in one
    /// step, cancelling any reader that was still running.
    fn attach(
        &self,
        session_id: &SessionId,
        query_id: &QueryId,
        messages: Vec<Message>,
        cancel: &CancellationToken,
        aborted: &Arc<AtomicBool>,
    ) -> Result<Session, QueryError> {
        let entry = self.active.entry(session_id.clone());
        if let Entry::Occupied(previous) = &entry {
            debug!(previous = %previous.get().query_id, next = %query_id, "cancelling previous reader");
            previous.get().cancel.cancel();
        }

        let session = self
            .sessions
            .update(session_id, &mut |mut session| {
                session.begin_query(query_id.clone(), messages.clone());
                session
            })
            .map_err(|e| store_error(session_id, e))?;

        entry.insert(ActiveQuery {
            query_id: query_id.clone(),
            cancel: cancel.clone(),
            aborted: aborted.clone(),
        });
        Ok(session)
    }

    async fn run_stream(
        &self,
        run: &Run<'_>,
        history: &[Message],
        config: &QueryConfig,
    ) -> Result<Session, QueryError> {
        let opened = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(run.interrupted()),
            opened = self.backend.stream_query(history, config) => opened,
        };
        let mut frames = match opened {
            Ok(frames) => frames,
            Err(e) => return Err(self.fail_transport(run, e)),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(run.interrupted()),
                next = frames.next() => next,
            };
            match next {
                None => return self.settle(run),
                Some(Err(e)) => return Err(self.fail_transport(run, e)),
                Some(Ok(value)) => {
                    let frame = match Frame::from_stream_value(value) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error_kind = e.error_kind(), error = %e, "dropping invalid frame");
                            continue;
                        }
                    };
                    if self.apply(run, &frame)? == Outcome::Stale {
                        return Err(run.interrupted());
                    }
                }
            }
        }
    }

    async fn run_single(
        &self,
        run: &Run<'_>,
        history: &[Message],
        config: &QueryConfig,
    ) -> Result<Session, QueryError> {
        let reply = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(run.interrupted()),
            reply = self.backend.query(history, config) => reply,
        };
        let value = match reply {
            Ok(value) => value,
            Err(e) => return Err(self.fail_transport(run, e)),
        };

        match Frame::from_complete_value(value) {
            Ok(frame) => {
                if self.apply(run, &frame)? == Outcome::Stale {
                    return Err(run.interrupted());
                }
                self.settle(run)
            }
            Err(e) => {
                self.fail(run.session_id, run.query_id, "protocol", &e.to_string());
                Err(QueryError::Protocol(e))
            }
        }
    }

    fn apply(&self, run: &Run<'_>, frame: &Frame) -> Result<Outcome, QueryError> {
        let mut outcome = Outcome::Stale;
        self.sessions
            .update(run.session_id, &mut |session| {
                let (next, applied) = dispatch(session, run.query_id, frame);
                outcome = applied;
                next
            })
            .map_err(|e| store_error(run.session_id, e))?;
        Ok(outcome)
    }

    fn settle(&self, run: &Run<'_>) -> Result<Session, QueryError> {
        let mut settled = false;
        let session = self
            .sessions
            .update(run.session_id, &mut |mut session| {
                settled = session.settle(run.query_id);
                session
            })
            .map_err(|e| store_error(run.session_id, e))?;
        if settled {
            Ok(session)
        } else {
            Err(run.interrupted())
        }
    }

    fn fail_transport(&self, run: &Run<'_>, error: TransportError) -> QueryError {
        self.fail(run.session_id, run.query_id, error.error_kind(), &error.to_string());
        QueryError::Transport(error)
    }

    /// Guarded: only the query that owns the session can fail it.
    fn fail(&self, session_id: &SessionId, query_id: &QueryId, kind: &str, message: &str) {
        let result = self.sessions.update(session_id, &mut |mut session| {
            session.fail(query_id, kind, message);
            session
        });
        if let Err(e) = result {
            debug!(session_id = %session_id, error = %e, "could not record query failure");
        }
    }
}

/// Unregisters the reader when `submit_query` returns or is dropped. A
/// dropped call still owning its session leaves it in Error, not in flight.
struct Release<'a> {
    orchestrator: &'a QueryOrchestrator,
    session_id: &'a SessionId,
    query_id: &'a QueryId,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.orchestrator
            .active
            .remove_if(self.session_id, |_, run| &run.query_id == self.query_id);
        self.orchestrator
            .fail(self.session_id, self.query_id, "cancelled", "query dropped before completion");
    }
}

fn store_error(session_id: &SessionId, error: StoreError) -> QueryError {
    match error {
        StoreError::NotFound(_) => QueryError::SessionNotFound(session_id.clone()),
        other => QueryError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_client::{MockBackend, MockReply};
    use quarry_core::errors::ValidationError;
    use quarry_core::messages::Role;
    use quarry_core::seeds::KnowledgeSeed;
    use quarry_core::session::Phase;
    use quarry_store::MemorySessionStore;
    use serde_json::json;

    struct Fixture {
        backend: Arc<MockBackend>,
        store: Arc<MemorySessionStore>,
        orchestrator: Arc<QueryOrchestrator>,
        session_id: SessionId,
    }

    fn fixture(replies: Vec<MockReply>) -> Fixture {
        let backend = Arc::new(MockBackend::with_replies(replies));
        let store = Arc::new(MemorySessionStore::new());
        let session_id = store.create("test").unwrap().id;
        let orchestrator = Arc::new(QueryOrchestrator::new(backend.clone(), store.clone()));
        Fixture {
            backend,
            store,
            orchestrator,
            session_id,
        }
    }

    fn config() -> QueryConfig {
        QueryConfig::new("tok", vec!["kb-main".into()])
    }

    fn single_config() -> QueryConfig {
        let mut config = config();
        config.stream = false;
        config
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn streaming_frames_accumulate_and_settle() {
        let f = fixture(vec![MockReply::Frames(vec![
            json!({"tag": "searching", "content": null}),
            json!({"tag": "seeds", "content": [
                {"content": "s1", "nip": 0.1},
                {"content": "s2", "nip": 0.2}
            ]}),
            json!({"tag": "final", "content": "A"}),
            json!({"tag": "final", "content": "B"}),
        ])]);

        let session = f
            .orchestrator
            .submit_query(&f.session_id, vec![Message::user("question")], &config())
            .await
            .unwrap();

        assert!(session.searching);
        assert_eq!(
            session.seeds,
            vec![KnowledgeSeed::new("s1", 0.1), KnowledgeSeed::new("s2", 0.2)]
        );
        assert_eq!(session.response, "AB");
        assert_eq!(session.phase, Phase::Settled);
        assert_eq!(session.messages.last(), Some(&Message::assistant("AB")));
        assert!(!f.orchestrator.state(&f.session_id).in_flight);
    }

    #[tokio::test]
    async fn single_response_replaces_previous_answer() {
        let f = fixture(vec![MockReply::answer(&["old ", "text"]), MockReply::complete("X")]);

        f.orchestrator
            .submit_query(&f.session_id, vec![Message::user("one")], &config())
            .await
            .unwrap();
        let session = f
            .orchestrator
            .submit_query(&f.session_id, vec![Message::user("two")], &single_config())
            .await
            .unwrap();

        assert_eq!(session.response, "X");
        assert_eq!(session.phase, Phase::Settled);
    }

    #[tokio::test]
    async fn request_carries_full_history() {
        let f = fixture(vec![MockReply::answer(&["first answer"]), MockReply::answer(&["second"])]);

        f.orchestrator
            .submit_query(&f.session_id, vec![Message::user("one")], &config())
            .await
            .unwrap();
        f.orchestrator
            .submit_query(&f.session_id, vec![Message::user("two")], &config())
            .await
            .unwrap();

        let sent = f.backend.sent_messages();
        assert_eq!(sent[0], vec![Message::user("one")]);
        assert_eq!(
            sent[1],
            vec![
                Message::user("one"),
                Message::assistant("first answer"),
                Message::user("two"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_knowledge_base_list_fails_before_network() {
        let f = fixture(vec![MockReply::answer(&["unused"])]);
        let mut config = config();
        config.kb_list.clear();

        let err = f
            .orchestrator
            .submit_query(&f.session_id, vec![Message::user("q")], &config)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueryError::Validation(ValidationError::MissingKnowledgeBase)
        ));
        assert_eq!(f.backend.query_calls(), 0);
        assert!(f.store.get(&f.session_id).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_fails_before_network() {
        let f = fixture(vec![]);
        let err = f
            .orchestrator
            .submit_query(&SessionId::new(), vec![Message::user("q")], &config())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::SessionNotFound(_)));
        assert_eq!(f.backend.query_calls(), 0);
    }

    #[tokio::test]
    async fn http_error_settles_session_in_error() {
        let f = fixture(vec![MockReply::Error(TransportError::from_status(
            503,
            "overloaded".into(),
        ))]);

        let err = f
            .orchestrator
            .submit_query(&f.session_id, vec![Message::user("q")], &config())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Transport(TransportError::Status { status: 503, .. })));

        let session = f.store.get(&f.session_id).unwrap();
        match &session.phase {
            Phase::Error { kind, message } => {
                assert_eq!(kind, "http_status");
                assert!(message.contains("503"));
                assert!(message.contains("overloaded"));
            }
            other => panic!("expected error phase, got {other:?}"),
        }
        assert!(session.response.is_empty());
        assert!(!session.searching);
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_answer() {
        let f = fixture(vec![MockReply::FramesThenError(
            vec![json!({"tag": "final", "content": "partial"})],
            TransportError::StreamInterrupted("connection reset".into()),
        )]);

        let err = f
            .orchestrator
            .submit_query(&f.session_id, vec![Message::user("q")], &config())
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "stream_interrupted");

        let session = f.store.get(&f.session_id).unwrap();
        assert_eq!(session.response, "partial");
        assert!(matches!(session.phase, Phase::Error { .. }));
        assert_eq!(session.messages.len(), 1);
    }

    #[tokio::test]
    async fn invalid_and_unknown_frames_are_skipped() {
        let f = fixture(vec![MockReply::Frames(vec![
            json!({"tag": "usage", "content": {"tokens": 12}}),
            json!({"tag": "seeds", "content": "not a list"}),
            json!({"no_tag": true}),
            json!({"tag": "final", "content": "ok"}),
        ])]);

        let session = f
            .orchestrator
            .submit_query(&f.session_id, vec![Message::user("q")], &config())
            .await
            .unwrap();
        assert_eq!(session.response, "ok");
        assert!(session.seeds.is_empty());
    }

    #[tokio::test]
    async fn single_response_with_wrong_tag_is_protocol_error() {
        let f = fixture(vec![MockReply::Complete(json!({"tag": "seeds", "content": []}))]);

        let err = f
            .orchestrator
            .submit_query(&f.session_id, vec![Message::user("q")], &single_config())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Protocol(_)));

        let session = f.store.get(&f.session_id).unwrap();
        assert!(matches!(&session.phase, Phase::Error { kind, .. } if kind == "protocol"));
    }

    #[tokio::test]
    async fn late_frames_from_superseded_query_are_dropped() {
        let (first_tx, first_reply) = MockReply::channel();
        let f = fixture(vec![first_reply, MockReply::answer(&["second answer"])]);

        let orchestrator = f.orchestrator.clone();
        let session_id = f.session_id.clone();
        let first = tokio::spawn(async move {
            orchestrator
                .submit_query(&session_id, vec![Message::user("first")], &config())
                .await
        });

        first_tx
            .send(Ok(json!({"tag": "final", "content": "early"})))
            .unwrap();
        let store = f.store.clone();
        let id = f.session_id.clone();
        wait_until(|| store.get(&id).unwrap().response == "early").await;

        let session = f
            .orchestrator
            .submit_query(&f.session_id, vec![Message::user("second")], &config())
            .await
            .unwrap();
        assert_eq!(session.response, "second answer");

        let _ = first_tx.send(Ok(json!({"tag": "final", "content": " late"})));
        let first_result = first.await.unwrap();
        assert!(matches!(first_result, Err(QueryError::Superseded)));

        let session = f.store.get(&f.session_id).unwrap();
        assert_eq!(session.response, "second answer");
        assert_eq!(session.phase, Phase::Settled);
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn abort_keeps_partial_answer() {
        let (tx, reply) = MockReply::channel();
        let f = fixture(vec![reply]);

        let orchestrator = f.orchestrator.clone();
        let session_id = f.session_id.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .submit_query(&session_id, vec![Message::user("q")], &config())
                .await
        });

        tx.send(Ok(json!({"tag": "final", "content": "half"}))).unwrap();
        let store = f.store.clone();
        let id = f.session_id.clone();
        wait_until(|| store.get(&id).unwrap().response == "half").await;
        assert!(f.orchestrator.state(&f.session_id).in_flight);

        assert!(f.orchestrator.abort(&f.session_id));
        assert!(matches!(task.await.unwrap(), Err(QueryError::Aborted)));

        let session = f.store.get(&f.session_id).unwrap();
        assert_eq!(session.response, "half");
        assert!(matches!(&session.phase, Phase::Error { kind, .. } if kind == "aborted"));
        assert!(!f.orchestrator.state(&f.session_id).in_flight);
        assert!(!f.orchestrator.abort(&f.session_id));
    }

    #[tokio::test]
    async fn abort_all_counts_in_flight_queries() {
        let (_tx_a, reply_a) = MockReply::channel();
        let (_tx_b, reply_b) = MockReply::channel();
        let f = fixture(vec![reply_a, reply_b]);
        let other = f.store.create("other").unwrap().id;

        let mut tasks = Vec::new();
        for id in [f.session_id.clone(), other.clone()] {
            let orchestrator = f.orchestrator.clone();
            tasks.push(tokio::spawn(async move {
                orchestrator
                    .submit_query(&id, vec![Message::user("q")], &config())
                    .await
            }));
        }
        let orchestrator = f.orchestrator.clone();
        let (a, b) = (f.session_id.clone(), other.clone());
        wait_until(|| orchestrator.state(&a).in_flight && orchestrator.state(&b).in_flight).await;

        assert_eq!(f.orchestrator.abort_all(), 2);
        for task in tasks {
            assert!(matches!(task.await.unwrap(), Err(QueryError::Aborted)));
        }
    }

    #[tokio::test]
    async fn dropped_call_leaves_session_in_error() {
        let (_tx, reply) = MockReply::channel();
        let f = fixture(vec![reply]);

        let orchestrator = f.orchestrator.clone();
        let session_id = f.session_id.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .submit_query(&session_id, vec![Message::user("q")], &config())
                .await
        });
        let orchestrator = f.orchestrator.clone();
        let id = f.session_id.clone();
        wait_until(|| orchestrator.state(&id).in_flight).await;

        task.abort();
        let _ = task.await;

        assert!(!f.orchestrator.state(&f.session_id).in_flight);
        let session = f.store.get(&f.session_id).unwrap();
        assert!(matches!(&session.phase, Phase::Error { kind, .. } if kind == "cancelled"));
    }
}
