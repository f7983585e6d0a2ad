//! End-to-end engine behaviour against an in-memory store and a scripted
//! registry.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use common::{FakeRegistry, FlakyStore, RecordingFailureSink, add_account, at, schedule, store};
use mail_scheduler::clock::ManualClock;
use mail_scheduler::engine::{Dispatcher, Reconciler, StoreFailureSink, recover_interrupted};
use mail_scheduler::error::MailboxError;
use mail_scheduler::store::libsql_backend::INTERRUPTED_SEND_REASON;
use mail_scheduler::store::{Database, MessageState, StateFields};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    store: Arc<dyn Database>,
    registry: Arc<FakeRegistry>,
    failures: Arc<RecordingFailureSink>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new(registry: FakeRegistry, start: chrono::DateTime<chrono::Utc>) -> Self {
        Self::with_store(store().await, registry, start)
    }

    fn with_store(
        store: Arc<dyn Database>,
        registry: FakeRegistry,
        start: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            failures: Arc::new(RecordingFailureSink::default()),
            clock: Arc::new(ManualClock::new(start)),
        }
    }

    fn dispatcher_with_timeout(&self, call_timeout: Duration) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.store),
            self.registry.clone(),
            self.failures.clone(),
            self.clock.clone(),
            call_timeout,
        )
    }

    fn dispatcher(&self) -> Dispatcher {
        self.dispatcher_with_timeout(CALL_TIMEOUT)
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.store),
            self.registry.clone(),
            self.failures.clone(),
            self.clock.clone(),
            CALL_TIMEOUT,
        )
    }

    async fn state_of(&self, id: uuid::Uuid) -> MessageState {
        self.store.get_message(id).await.unwrap().unwrap().state
    }

    /// Thread id present exactly on `sent` and `replied` rows.
    async fn assert_thread_invariant(&self) {
        for msg in self.store.list_messages(1000).await.unwrap() {
            let expects_thread = matches!(msg.state, MessageState::Sent | MessageState::Replied);
            assert_eq!(
                msg.provider_thread_id.is_some(),
                expects_thread,
                "message {} in state {} has thread {:?}",
                msg.id,
                msg.state,
                msg.provider_thread_id
            );
        }
    }
}

fn no_shutdown() -> AtomicBool {
    AtomicBool::new(false)
}

#[tokio::test]
async fn message_is_not_sent_before_its_time() {
    let h = Harness::new(FakeRegistry::new(), at(9, 59)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;

    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.due, 0);
    assert_eq!(h.registry.send_count(), 0);
    assert_eq!(h.state_of(id).await, MessageState::Pending);

    h.clock.set(at(10, 1));
    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.sent, 1);

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Sent);
    assert_eq!(msg.provider_thread_id.as_deref(), Some("<msg-1@example.com>"));
    assert_eq!(msg.provider_message_id.as_deref(), Some("<msg-1@example.com>"));
    assert_eq!(msg.sent_at, Some(at(10, 1)));
    assert_eq!(msg.attempts, 1);
    assert_eq!(h.registry.sends()[0].account_id, account);
}

#[tokio::test]
async fn reply_in_thread_marks_replied() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.dispatcher().run_pass(&no_shutdown()).await;

    h.clock.advance(ChronoDuration::minutes(30));
    h.registry.answer_replies(Ok(false));
    h.reconciler().run_pass(&no_shutdown()).await;
    assert_eq!(h.state_of(id).await, MessageState::Sent);

    h.clock.advance(ChronoDuration::minutes(30));
    h.registry.answer_replies(Ok(true));
    let report = h.reconciler().run_pass(&no_shutdown()).await;
    assert_eq!(report.replied, 1);

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Replied);
    assert_eq!(msg.replied_at, Some(at(11, 1)));

    let inbox = h.store.list_replies(Some(account), 10).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].message_id, id);
    assert_eq!(inbox[0].recorded_at, at(11, 1));

    // Replied is terminal: later passes leave it alone.
    let checks = h.registry.reply_checks();
    h.reconciler().run_pass(&no_shutdown()).await;
    assert_eq!(h.registry.reply_checks(), checks);
    h.assert_thread_invariant().await;
}

#[tokio::test]
async fn auth_failure_fails_once_and_is_never_resent() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.registry
        .script_send(Err(MailboxError::auth(account.to_string(), "535 bad credentials")));

    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.failed, 1);

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Failed);
    assert!(msg.last_error.as_deref().unwrap().starts_with("auth:"));
    assert!(msg.provider_thread_id.is_none());

    let records = h.failures.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, id);

    h.clock.advance(ChronoDuration::hours(1));
    h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(h.registry.send_count(), 1);
    assert_eq!(h.failures.records().len(), 1);
}

#[tokio::test]
async fn transient_send_failure_is_not_retried() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.registry
        .script_send(Err(MailboxError::transient("421 service not available")));

    h.dispatcher().run_pass(&no_shutdown()).await;
    h.dispatcher().run_pass(&no_shutdown()).await;

    assert_eq!(h.state_of(id).await, MessageState::Failed);
    assert_eq!(h.registry.send_count(), 1);
}

#[tokio::test]
async fn reply_check_error_leaves_message_sent() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.dispatcher().run_pass(&no_shutdown()).await;

    h.registry
        .answer_replies(Err(MailboxError::transient("IMAP connection closed")));
    let report = h.reconciler().run_pass(&no_shutdown()).await;
    assert_eq!(report.failed, 1);

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Sent);
    assert!(msg.last_checked_at.is_none());
    assert_eq!(h.failures.records().len(), 1);

    // The next pass checks again.
    h.registry.answer_replies(Ok(true));
    h.reconciler().run_pass(&no_shutdown()).await;
    assert_eq!(h.state_of(id).await, MessageState::Replied);
}

#[tokio::test]
async fn concurrent_dispatchers_send_exactly_once() {
    let registry = FakeRegistry::new().with_send_delay(Duration::from_millis(20));
    let h = Harness::new(registry, at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;

    let first = h.dispatcher();
    let second = h.dispatcher();
    let flag = no_shutdown();
    let (a, b) = tokio::join!(first.run_pass(&flag), second.run_pass(&flag));

    assert_eq!(h.registry.send_count(), 1);
    assert_eq!(a.sent + b.sent, 1);
    assert_eq!(h.state_of(id).await, MessageState::Sent);
}

#[tokio::test]
async fn concurrent_reconcilers_check_once() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.dispatcher().run_pass(&no_shutdown()).await;

    let first = h.reconciler();
    let second = h.reconciler();
    let flag = no_shutdown();
    let (a, b) = tokio::join!(first.run_pass(&flag), second.run_pass(&flag));

    // Every mailbox query was preceded by a won claim.
    assert_eq!(h.registry.reply_checks(), a.no_reply + b.no_reply);
    assert!(h.registry.reply_checks() >= 1);
    assert_eq!(h.state_of(id).await, MessageState::Sent);
}

#[tokio::test]
async fn due_messages_go_out_oldest_first() {
    let h = Harness::new(FakeRegistry::new(), at(12, 0)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    schedule(&h.store, account, "third", at(11, 30)).await;
    schedule(&h.store, account, "first", at(9, 0)).await;
    schedule(&h.store, account, "second", at(10, 15)).await;
    schedule(&h.store, account, "future", at(13, 0)).await;

    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.due, 3);

    let subjects: Vec<String> = h.registry.sends().into_iter().map(|c| c.subject).collect();
    assert_eq!(subjects, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn slow_send_times_out_into_failed() {
    let registry = FakeRegistry::new().with_send_delay(Duration::from_secs(30));
    let h = Harness::new(registry, at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;

    let report = h
        .dispatcher_with_timeout(Duration::from_millis(100))
        .run_pass(&no_shutdown())
        .await;
    assert_eq!(report.failed, 1);

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Failed);
    assert!(msg.last_error.as_deref().unwrap().contains("timed out"));
    assert_eq!(h.failures.records().len(), 1);
}

#[tokio::test]
async fn shutdown_stops_pass_between_messages() {
    let flag = Arc::new(AtomicBool::new(false));
    let registry = FakeRegistry::new().tripping(Arc::clone(&flag));
    let h = Harness::new(registry, at(12, 0)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let first = schedule(&h.store, account, "a", at(9, 0)).await;
    let second = schedule(&h.store, account, "b", at(9, 1)).await;
    let third = schedule(&h.store, account, "c", at(9, 2)).await;

    let report = h.dispatcher().run_pass(&flag).await;
    assert!(report.interrupted);
    assert_eq!(report.sent, 1);

    // The in-flight send completed and was recorded; the rest wait.
    assert_eq!(h.state_of(first).await, MessageState::Sent);
    assert_eq!(h.state_of(second).await, MessageState::Pending);
    assert_eq!(h.state_of(third).await, MessageState::Pending);
}

#[tokio::test]
async fn failed_message_can_be_rescheduled() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.registry
        .script_send(Err(MailboxError::permanent("550 mailbox unavailable")));
    h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(h.state_of(id).await, MessageState::Failed);

    assert!(h.store.reschedule_message(id, at(11, 0)).await.unwrap());
    h.clock.set(at(11, 0));
    h.dispatcher().run_pass(&no_shutdown()).await;

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Sent);
    assert_eq!(msg.attempts, 2);
    assert!(msg.last_error.is_none());
}

#[tokio::test]
async fn thread_invariant_holds_across_mixed_passes() {
    let h = Harness::new(FakeRegistry::new(), at(12, 0)).await;
    let alice = add_account(&h.store, "alice@example.com").await;
    let carol = add_account(&h.store, "carol@example.com").await;

    schedule(&h.store, alice, "ok-1", at(9, 0)).await;
    schedule(&h.store, carol, "bad", at(9, 30)).await;
    schedule(&h.store, alice, "ok-2", at(10, 0)).await;
    schedule(&h.store, carol, "later", at(15, 0)).await;

    h.registry.script_send(Ok(()));
    h.registry
        .script_send(Err(MailboxError::auth(carol.to_string(), "534 app password required")));
    h.dispatcher().run_pass(&no_shutdown()).await;
    h.assert_thread_invariant().await;

    h.registry.answer_replies(Ok(true));
    h.reconciler().run_pass(&no_shutdown()).await;
    h.assert_thread_invariant().await;

    let stats = h.store.account_stats(alice).await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.replied, 2);
    let stats = h.store.account_stats(carol).await.unwrap();
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn recovery_releases_claims_without_resending() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let stuck_send = schedule(&h.store, account, "stuck", at(9, 0)).await;
    let stuck_check = schedule(&h.store, account, "checked", at(9, 30)).await;

    // Simulate a crash mid-send and mid-check.
    h.store
        .update_state(stuck_send, MessageState::Pending, MessageState::Sending, &StateFields::default())
        .await
        .unwrap();
    h.store
        .update_state(stuck_check, MessageState::Pending, MessageState::Sending, &StateFields::default())
        .await
        .unwrap();
    let sent = StateFields {
        provider_message_id: Some("<t1@example.com>".into()),
        provider_thread_id: Some("<t1@example.com>".into()),
        sent_at: Some(at(9, 30)),
        ..Default::default()
    };
    h.store
        .update_state(stuck_check, MessageState::Sending, MessageState::Sent, &sent)
        .await
        .unwrap();
    h.store
        .update_state(stuck_check, MessageState::Sent, MessageState::Checking, &StateFields::default())
        .await
        .unwrap();

    let report = recover_interrupted(h.store.as_ref(), h.failures.as_ref())
        .await
        .unwrap();
    assert_eq!(report.released_checks, 1);
    assert_eq!(report.abandoned_sends, vec![stuck_send]);
    assert_eq!(
        h.failures.records(),
        vec![(stuck_send, INTERRUPTED_SEND_REASON.to_string())]
    );

    assert_eq!(h.state_of(stuck_send).await, MessageState::Failed);
    assert_eq!(h.state_of(stuck_check).await, MessageState::Sent);

    h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(h.registry.send_count(), 0);
    h.assert_thread_invariant().await;
}

#[tokio::test]
async fn store_failure_sink_keeps_a_log() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.registry
        .script_send(Err(MailboxError::permanent("550 no such user")));

    let dispatcher = Dispatcher::new(
        Arc::clone(&h.store),
        h.registry.clone(),
        Arc::new(StoreFailureSink::new(Arc::clone(&h.store), h.clock.clone())),
        h.clock.clone(),
        CALL_TIMEOUT,
    );
    dispatcher.run_pass(&no_shutdown()).await;

    let log = h.store.list_failures(id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].reason.starts_with("permanent:"));
    assert_eq!(log[0].recorded_at, at(10, 1));
}

#[tokio::test]
async fn sent_outcome_survives_a_brief_store_outage() {
    let flaky = Arc::new(FlakyStore::new().await);
    let h = Harness::with_store(flaky.clone(), FakeRegistry::new(), at(10, 1));
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;

    flaky.fail_outcome_writes(MessageState::Sent, 2);
    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.sent, 1);
    assert_eq!(report.store_errors, 0);

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Sent);
    assert_eq!(msg.provider_thread_id.as_deref(), Some("<msg-1@example.com>"));
    h.assert_thread_invariant().await;
}

#[tokio::test]
async fn unrecorded_send_is_completed_from_its_receipt() {
    let flaky = Arc::new(FlakyStore::new().await);
    let h = Harness::with_store(flaky.clone(), FakeRegistry::new(), at(10, 1));
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;

    flaky.fail_outcome_writes(MessageState::Sent, 3);
    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.store_errors, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(h.state_of(id).await, MessageState::Sending);

    h.clock.advance(ChronoDuration::minutes(1));
    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.receipts_applied, 1);

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Sent);
    assert_eq!(msg.provider_thread_id.as_deref(), Some("<msg-1@example.com>"));
    assert_eq!(msg.sent_at, Some(at(10, 1)));
    assert_eq!(h.registry.send_count(), 1);
    assert!(h.failures.records().is_empty());
    h.assert_thread_invariant().await;
}

#[tokio::test]
async fn receipt_kept_across_a_restart_is_confirmed_not_failed() {
    let flaky = Arc::new(FlakyStore::new().await);
    let h = Harness::with_store(flaky.clone(), FakeRegistry::new(), at(10, 1));
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;

    flaky.fail_outcome_writes(MessageState::Sent, 3);
    h.dispatcher().run_pass(&no_shutdown()).await;

    let report = recover_interrupted(h.store.as_ref(), h.failures.as_ref())
        .await
        .unwrap();
    assert_eq!(report.confirmed_sends, vec![id]);
    assert!(report.abandoned_sends.is_empty());
    assert!(h.failures.records().is_empty());

    let msg = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Sent);
    assert_eq!(msg.provider_thread_id.as_deref(), Some("<msg-1@example.com>"));
}

#[tokio::test]
async fn unrecorded_send_without_receipt_is_failed_by_recovery() {
    let flaky = Arc::new(FlakyStore::new().await);
    let h = Harness::with_store(flaky.clone(), FakeRegistry::new(), at(10, 1));
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;

    flaky.fail_outcome_writes(MessageState::Sent, 3);
    flaky.fail_receipts();
    h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(h.state_of(id).await, MessageState::Sending);

    let report = recover_interrupted(h.store.as_ref(), h.failures.as_ref())
        .await
        .unwrap();
    assert_eq!(report.abandoned_sends, vec![id]);
    assert_eq!(h.state_of(id).await, MessageState::Failed);
    assert_eq!(h.failures.records().len(), 1);
    assert_eq!(h.registry.send_count(), 1);
}

#[tokio::test]
async fn unrecorded_send_failure_is_reported_exactly_once() {
    let flaky = Arc::new(FlakyStore::new().await);
    let h = Harness::with_store(flaky.clone(), FakeRegistry::new(), at(10, 1));
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.registry
        .script_send(Err(MailboxError::auth(account.to_string(), "535 bad credentials")));

    flaky.fail_outcome_writes(MessageState::Failed, 3);
    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.store_errors, 1);
    assert_eq!(report.failed, 0);
    assert!(h.failures.records().is_empty());
    assert_eq!(h.state_of(id).await, MessageState::Sending);

    recover_interrupted(h.store.as_ref(), h.failures.as_ref())
        .await
        .unwrap();
    assert_eq!(h.state_of(id).await, MessageState::Failed);
    assert_eq!(
        h.failures.records(),
        vec![(id, INTERRUPTED_SEND_REASON.to_string())]
    );

    h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(h.failures.records().len(), 1);
    assert_eq!(h.registry.send_count(), 1);
}

#[tokio::test]
async fn failure_write_retried_through_a_brief_outage() {
    let flaky = Arc::new(FlakyStore::new().await);
    let h = Harness::with_store(flaky.clone(), FakeRegistry::new(), at(10, 1));
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.registry
        .script_send(Err(MailboxError::permanent("550 no such user")));

    flaky.fail_outcome_writes(MessageState::Failed, 1);
    let report = h.dispatcher().run_pass(&no_shutdown()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(h.state_of(id).await, MessageState::Failed);
    assert_eq!(h.failures.records().len(), 1);
}

#[tokio::test]
async fn repeated_reply_check_errors_log_one_row() {
    let h = Harness::new(FakeRegistry::new(), at(10, 1)).await;
    let account = add_account(&h.store, "alice@example.com").await;
    let id = schedule(&h.store, account, "hello", at(10, 0)).await;
    h.dispatcher().run_pass(&no_shutdown()).await;

    let reconciler = Reconciler::new(
        Arc::clone(&h.store),
        h.registry.clone(),
        Arc::new(StoreFailureSink::new(Arc::clone(&h.store), h.clock.clone())),
        h.clock.clone(),
        CALL_TIMEOUT,
    );
    h.registry
        .answer_replies(Err(MailboxError::transient("IMAP connection closed")));
    for _ in 0..5 {
        h.clock.advance(ChronoDuration::minutes(2));
        reconciler.run_pass(&no_shutdown()).await;
    }
    assert_eq!(h.registry.reply_checks(), 5);
    assert_eq!(h.store.list_failures(id).await.unwrap().len(), 1);
}
