//! End-to-end call flows over the in-memory signaling store and the
//! loopback media engine.

use collabcall::store::{CallStatus, CandidateRecord, CandidateSide};
use collabcall::{
    CallConfig, CallController, CallError, CallEvent, CallPhase, EndReason, IncomingCallPrompt,
    LoopbackMediaEngine, MemorySignalingStore, PeerInfo, SessionContext, SignalingStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

type Events = mpsc::UnboundedReceiver<CallEvent>;

struct Harness {
    store: Arc<MemorySignalingStore>,
    engine: Arc<LoopbackMediaEngine>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemorySignalingStore::new()),
            engine: Arc::new(LoopbackMediaEngine::new()),
        }
    }

    fn controller(&self, me: &str, name: &str, peer: &str) -> (CallController, Events) {
        self.controller_with_config(me, name, peer, CallConfig::default())
    }

    fn controller_with_config(
        &self,
        me: &str,
        name: &str,
        peer: &str,
        config: CallConfig,
    ) -> (CallController, Events) {
        CallController::new(
            self.store.clone(),
            self.engine.clone(),
            SessionContext::new(me, name),
            PeerInfo::new(peer, name.to_uppercase()),
            config,
        )
    }
}

async fn wait_phase(controller: &CallController, pred: fn(&CallPhase) -> bool) {
    let mut watch = controller.phase_watch();
    timeout(Duration::from_secs(5), watch.wait_for(pred))
        .await
        .expect("timed out waiting for call phase")
        .expect("session task ended");
}

async fn next_prompt(events: &mut Events) -> IncomingCallPrompt {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for incoming call")
            .expect("event stream closed");
        if let CallEvent::IncomingCall(prompt) = event {
            return prompt;
        }
    }
}

async fn next_end_reason(events: &mut Events) -> EndReason {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for call end")
            .expect("event stream closed");
        if let CallEvent::PhaseChanged(CallPhase::Ended { reason, .. }) = event {
            return reason;
        }
    }
}

async fn wait_remote_media(events: &mut Events) {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for remote media")
            .expect("event stream closed");
        if let CallEvent::RemoteMedia(_) = event {
            return;
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn connect(
    caller: &CallController,
    callee: &CallController,
    callee_events: &mut Events,
) -> IncomingCallPrompt {
    caller.initiate().await.expect("initiate failed");
    let prompt = next_prompt(callee_events).await;
    callee.answer().await.expect("answer failed");
    wait_phase(caller, CallPhase::is_connected).await;
    wait_phase(callee, CallPhase::is_connected).await;
    prompt
}

#[tokio::test]
async fn test_capture_denial_aborts_outgoing_call() {
    let h = Harness::new();
    h.engine.deny_capture(true);
    let (alice, mut alice_events) = h.controller("alice", "Alice", "bob");

    let err = alice.initiate().await.unwrap_err();
    assert!(matches!(err, CallError::Media(_)));
    assert!(alice.phase().is_idle());

    // Nothing was written to the channel and nothing is held locally.
    assert_eq!(h.store.call_count(), 0);
    assert_eq!(h.store.notification_count(), 0);
    assert_eq!(h.engine.live_captures(), 0);

    let notice = timeout(Duration::from_secs(1), alice_events.recv())
        .await
        .expect("expected a notice")
        .expect("event stream closed");
    assert!(matches!(
        notice,
        CallEvent::Notice(collabcall::CallNotice::MediaAccessDenied)
    ));

    alice.dispose().await;
}

#[tokio::test]
async fn test_full_call_connects_both_sides() {
    let h = Harness::new();
    let (alice, mut alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    alice.initiate().await.unwrap();
    assert!(matches!(alice.phase(), CallPhase::Calling { .. }));

    let prompt = next_prompt(&mut bob_events).await;
    assert_eq!(prompt.caller_id.as_str(), "alice");
    assert_eq!(prompt.caller_name, "Alice");
    assert!(bob.phase().can_accept());

    bob.answer().await.unwrap();
    wait_phase(&alice, CallPhase::is_connected).await;
    wait_phase(&bob, CallPhase::is_connected).await;

    // The record carries the answer, the ring notification is gone.
    let record = h.store.get_call(&prompt.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Active);
    assert!(record.answer.is_some());
    assert_eq!(h.store.notification_count(), 0);

    // Both sides see the remote stream and both candidate sequences drain
    // into the media sessions.
    wait_remote_media(&mut alice_events).await;
    wait_remote_media(&mut bob_events).await;
    let per_side = h.engine.candidate_count();
    wait_until(|| h.store.candidate_count(&prompt.call_id, CandidateSide::Offer) == per_side).await;
    wait_until(|| h.store.candidate_count(&prompt.call_id, CandidateSide::Answer) == per_side).await;
    wait_until(|| h.engine.candidates_applied() == 2 * per_side).await;

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_decline_resolves_both_sides() {
    let h = Harness::new();
    let (alice, mut alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    alice.initiate().await.unwrap();
    let prompt = next_prompt(&mut bob_events).await;
    bob.decline().await.unwrap();

    wait_phase(&bob, CallPhase::is_idle).await;
    wait_phase(&alice, CallPhase::is_idle).await;
    assert_eq!(next_end_reason(&mut alice_events).await, EndReason::RemoteDeclined);

    let record = h.store.get_call(&prompt.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Declined);
    assert_eq!(h.store.notification_count(), 0);

    // The caller's capture is released once the decline lands.
    wait_until(|| h.engine.live_captures() == 0).await;

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_hang_up_after_connect() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    let prompt = connect(&alice, &bob, &mut bob_events).await;

    alice.hang_up().await.unwrap();
    wait_phase(&alice, CallPhase::is_idle).await;
    wait_phase(&bob, CallPhase::is_idle).await;
    assert_eq!(next_end_reason(&mut bob_events).await, EndReason::RemoteEnded);

    let record = h.store.get_call(&prompt.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    wait_until(|| h.engine.live_captures() == 0).await;

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_hang_up_is_idempotent() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    connect(&alice, &bob, &mut bob_events).await;

    alice.hang_up().await.unwrap();
    wait_phase(&alice, CallPhase::is_idle).await;
    // Hanging up with no call in progress is a no-op.
    alice.hang_up().await.unwrap();
    assert!(alice.phase().is_idle());

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_second_initiate_rejected_while_calling() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (_bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    alice.initiate().await.unwrap();
    let _prompt = next_prompt(&mut bob_events).await;

    let err = alice.initiate().await.unwrap_err();
    assert!(matches!(err, CallError::CallInProgress));
    assert_eq!(h.store.call_count(), 1);

    alice.dispose().await;
}

#[tokio::test]
async fn test_ring_suppressed_while_busy() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");
    let (charlie, _charlie_events) = h.controller("charlie", "Charlie", "bob");

    connect(&alice, &bob, &mut bob_events).await;

    // A third party rings Bob mid-call; Bob must stay connected and never
    // see a prompt for it.
    charlie.initiate().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(bob.phase().is_connected());
    while let Ok(event) = bob_events.try_recv() {
        assert!(
            !matches!(event, CallEvent::IncomingCall(_)),
            "busy callee saw a second prompt"
        );
    }
    assert!(matches!(charlie.phase(), CallPhase::Calling { .. }));

    charlie.hang_up().await.unwrap();
    alice.dispose().await;
    bob.dispose().await;
    charlie.dispose().await;
}

#[tokio::test]
async fn test_early_candidates_buffer_until_answer() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    alice.initiate().await.unwrap();
    let prompt = next_prompt(&mut bob_events).await;

    // An answer-side candidate lands before any answer exists. The caller
    // must hold it back: the media session has no remote description yet.
    h.store
        .append_candidate(
            &prompt.call_id,
            CandidateSide::Answer,
            CandidateRecord::new("candidate:early"),
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.engine.candidates_applied(), 0);

    bob.answer().await.unwrap();
    wait_phase(&alice, CallPhase::is_connected).await;

    // The buffered candidate is flushed along with the live ones.
    let expected = 2 * h.engine.candidate_count() + 1;
    wait_until(|| h.engine.candidates_applied() == expected).await;

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_failed_create_leaves_no_partial_state() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");

    h.store.fail_next_write();
    let err = alice.initiate().await.unwrap_err();
    assert!(matches!(err, CallError::Store(_)));
    assert!(alice.phase().is_idle());
    assert_eq!(h.store.call_count(), 0);
    assert_eq!(h.store.notification_count(), 0);
    wait_until(|| h.engine.live_captures() == 0).await;

    // The session recovers: the next attempt goes through.
    let (_bob, mut bob_events) = h.controller("bob", "Bob", "alice");
    alice.initiate().await.unwrap();
    next_prompt(&mut bob_events).await;

    alice.dispose().await;
}

#[tokio::test]
async fn test_answer_after_remote_resolution_fails() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    alice.initiate().await.unwrap();
    let prompt = next_prompt(&mut bob_events).await;

    // The call resolves out from under the ringing prompt.
    h.store
        .set_status(&prompt.call_id, CallStatus::Ended, None)
        .await
        .unwrap();

    let err = bob.answer().await.unwrap_err();
    assert!(matches!(err, CallError::NoLongerAvailable));
    wait_phase(&bob, CallPhase::is_idle).await;
    wait_until(|| h.engine.live_captures() == 0).await;

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_unanswered_ring_times_out_as_decline() {
    let h = Harness::new();
    let (alice, mut alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller_with_config(
        "bob",
        "Bob",
        "alice",
        CallConfig {
            ring_timeout: Duration::from_millis(200),
        },
    );

    alice.initiate().await.unwrap();
    let prompt = next_prompt(&mut bob_events).await;
    assert!(bob.phase().can_accept());

    // Nobody touches the prompt; the ring timer declines on Bob's behalf.
    wait_phase(&bob, CallPhase::is_idle).await;
    assert_eq!(next_end_reason(&mut alice_events).await, EndReason::RemoteDeclined);
    wait_phase(&alice, CallPhase::is_idle).await;

    let record = h.store.get_call(&prompt.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Declined);
    assert_eq!(h.store.notification_count(), 0);

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_caller_hang_up_withdraws_the_prompt() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    alice.initiate().await.unwrap();
    let prompt = next_prompt(&mut bob_events).await;
    assert!(bob.phase().can_accept());

    alice.hang_up().await.unwrap();

    // Bob's prompt is dismissed without any action on his side.
    loop {
        let event = timeout(Duration::from_secs(5), bob_events.recv())
            .await
            .expect("timed out waiting for withdrawal")
            .expect("event stream closed");
        if let CallEvent::PromptWithdrawn { notif_id } = event {
            assert_eq!(notif_id, prompt.notif_id);
            break;
        }
    }
    wait_phase(&bob, CallPhase::is_idle).await;
    assert_eq!(h.store.notification_count(), 0);

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_duplicate_record_delivery_applies_answer_once() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    let prompt = connect(&alice, &bob, &mut bob_events).await;
    let per_side = h.engine.candidate_count();
    wait_until(|| h.engine.candidates_applied() == 2 * per_side).await;

    // A redundant write re-dispatches the answered record unchanged. The
    // caller must not re-apply the answer: doing so would fail the media
    // session and drop the call.
    h.store
        .set_status(&prompt.call_id, CallStatus::Active, None)
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(alice.phase().is_connected());
    assert!(bob.phase().is_connected());
    assert_eq!(h.engine.candidates_applied(), 2 * per_side);

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_candidates_after_hang_up_are_discarded() {
    let h = Harness::new();
    let (alice, mut alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    let prompt = connect(&alice, &bob, &mut bob_events).await;
    let per_side = h.engine.candidate_count();
    wait_until(|| h.engine.candidates_applied() == 2 * per_side).await;

    alice.hang_up().await.unwrap();
    wait_phase(&alice, CallPhase::is_idle).await;
    wait_phase(&bob, CallPhase::is_idle).await;

    // Late arrivals on both consumed sequences must vanish silently.
    h.store
        .append_candidate(
            &prompt.call_id,
            CandidateSide::Answer,
            CandidateRecord::new("candidate:late-answer"),
        )
        .await
        .unwrap();
    h.store
        .append_candidate(
            &prompt.call_id,
            CandidateSide::Offer,
            CandidateRecord::new("candidate:late-offer"),
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(h.engine.candidates_applied(), 2 * per_side);
    assert!(alice.phase().is_idle());
    assert!(bob.phase().is_idle());
    while let Ok(event) = alice_events.try_recv() {
        assert!(!matches!(event, CallEvent::Notice(_)));
    }
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, CallEvent::Notice(_)));
    }

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_answer_read_failure_surfaces_a_notice() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    alice.initiate().await.unwrap();
    next_prompt(&mut bob_events).await;

    h.store.fail_next_read();
    let err = bob.answer().await.unwrap_err();
    assert!(matches!(err, CallError::Store(_)));
    wait_phase(&bob, CallPhase::is_idle).await;
    wait_until(|| h.engine.live_captures() == 1).await; // only alice's

    let mut saw_failure_notice = false;
    while let Ok(event) = bob_events.try_recv() {
        if matches!(
            event,
            CallEvent::Notice(collabcall::CallNotice::SignalingFailed(_))
        ) {
            saw_failure_notice = true;
        }
    }
    assert!(saw_failure_notice, "no signaling-failure notice surfaced");

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_dispose_mid_call_resolves_the_record() {
    let h = Harness::new();
    let (alice, _alice_events) = h.controller("alice", "Alice", "bob");
    let (bob, mut bob_events) = h.controller("bob", "Bob", "alice");

    let prompt = connect(&alice, &bob, &mut bob_events).await;

    // Dropping out mid-call (tab closed) still ends the call on the wire.
    alice.dispose().await;
    wait_phase(&bob, CallPhase::is_idle).await;
    let record = h.store.get_call(&prompt.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);

    bob.dispose().await;
}
