use std::num::NonZeroU64;
use std::time::Duration;

use super::*;
use crate::codec::{Code, Message, MessageType};
use crate::test_utils::{memory_pair, MemoryDialer, MemoryPeer};

const WAIT: Duration = Duration::from_secs(5);

fn request() -> ObserveRequest {
    ObserveRequest {
        host: "localhost".into(),
        port: 5684,
        path: "/obs".into(),
    }
}

fn settings(threshold: u64) -> ObserveSettings {
    ObserveSettings {
        threshold: NonZeroU64::new(threshold).unwrap(),
        ..ObserveSettings::default()
    }
}

async fn accept_registration(peer: &mut MemoryPeer) -> Token {
    let request = peer.next_message(WAIT).await.expect("registration request");
    assert_eq!(request.observe(), Some(0));
    peer.push(
        &Message::new(MessageType::Acknowledgement, Code::CONTENT, request.message_id, request.token)
            .with_observe(0),
    );
    request.token
}

fn push_notification(peer: &MemoryPeer, token: Token, seq: u32) {
    peer.push(
        &Message::new(MessageType::NonConfirmable, Code::CONTENT, seq as u16, token)
            .with_observe(seq)
            .with_payload(format!("reading {}", seq)),
    );
}

async fn barrier(peer: &mut MemoryPeer) {
    peer.push(&Message::ping(0xBEEF));
    let reset = peer.next_message(WAIT).await.expect("reset for barrier ping");
    assert_eq!(reset.mtype, MessageType::Reset);
}

/// Yield until the orchestrator reaches `expected`.
async fn settle_into<D: SessionDialer>(orchestrator: &ObserveOrchestrator<D>, expected: OrchestratorState) {
    for _ in 0..100 {
        if orchestrator.state() == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("orchestrator stuck in {}", orchestrator.state());
}

#[tokio::test]
async fn test_threshold_reached_then_deregistered_and_closed() {
    let (transport, mut peer) = memory_pair();
    let orchestrator = ObserveOrchestrator::new(MemoryDialer::new(transport), settings(10));

    let server = async {
        let token = accept_registration(&mut peer).await;
        for seq in 1..=9 {
            push_notification(&peer, token, seq);
        }
        barrier(&mut peer).await;
        settle_into(&orchestrator, OrchestratorState::AwaitingThreshold).await;
        tokio::task::yield_now().await;
        assert_eq!(orchestrator.state(), OrchestratorState::AwaitingThreshold);

        push_notification(&peer, token, 10);
        let cancel = peer.next_message(WAIT).await.expect("cancellation");
        assert_eq!(cancel.observe(), Some(1));
        assert_eq!(cancel.token, token);
        peer.push(&Message::new(
            MessageType::Acknowledgement,
            Code::CONTENT,
            cancel.message_id,
            cancel.token,
        ));
        assert!(peer.wait_client_closed(WAIT).await);
        token
    };

    let req = request();
    let (report, token) = tokio::join!(orchestrator.run(&req), server);
    let report = report.unwrap();

    assert_eq!(report.token, token);
    assert_eq!(report.completion, Completion::ThresholdReached);
    assert_eq!(report.delivered, 10);
    assert_eq!(report.cancel, CancelOutcome::Acknowledged);
    assert_eq!(orchestrator.state(), OrchestratorState::Done);
    assert!(peer.is_client_closed());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_deregisters_and_reports_timeout() {
    let (transport, mut peer) = memory_pair();
    let orchestrator = ObserveOrchestrator::new(MemoryDialer::new(transport), settings(10));

    let server = async {
        let token = accept_registration(&mut peer).await;
        for seq in 1..=3 {
            push_notification(&peer, token, seq);
        }
        let cancel = peer.next_message(Duration::from_secs(120)).await.expect("cancellation");
        assert_eq!(cancel.observe(), Some(1));
        assert_eq!(cancel.token, token);
    };

    let req = request();
    let (report, _) = tokio::join!(orchestrator.run(&req), server);
    let report = report.unwrap();

    assert_eq!(report.completion, Completion::TimedOut);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.cancel, CancelOutcome::Unacknowledged);
    assert_eq!(orchestrator.state(), OrchestratorState::Done);
    assert!(peer.is_client_closed());
}

#[tokio::test]
async fn test_stale_notifications_do_not_count() {
    let (transport, mut peer) = memory_pair();
    let orchestrator = ObserveOrchestrator::new(MemoryDialer::new(transport), settings(3));

    let server = async {
        let token = accept_registration(&mut peer).await;
        for seq in [1, 2, 2, 1, 0] {
            push_notification(&peer, token, seq);
        }
        barrier(&mut peer).await;
        settle_into(&orchestrator, OrchestratorState::AwaitingThreshold).await;
        tokio::task::yield_now().await;
        assert_eq!(orchestrator.state(), OrchestratorState::AwaitingThreshold);

        push_notification(&peer, token, 3);
        let cancel = peer.next_message(WAIT).await.expect("cancellation");
        peer.push(&Message::reset(cancel.message_id));
    };

    let req = request();
    let (report, _) = tokio::join!(orchestrator.run(&req), server);
    let report = report.unwrap();
    assert_eq!(report.completion, Completion::ThresholdReached);
    assert_eq!(report.delivered, 3);
}

#[tokio::test]
async fn test_handshake_failure_attempts_no_registration() {
    let dialer = MemoryDialer::failing(HandshakeError::Rejected {
        remote: "127.0.0.1:5684".into(),
        reason: "unknown certificate authority".into(),
    });
    let orchestrator = ObserveOrchestrator::new(dialer, settings(10));

    let err = orchestrator.run(&request()).await.unwrap_err();

    assert!(matches!(err, ObserveError::Handshake(HandshakeError::Rejected { .. })));
    assert_eq!(orchestrator.state(), OrchestratorState::Failed);
    assert_eq!(orchestrator.dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registration_timeout_is_fatal_and_closes_session() {
    let (transport, peer) = memory_pair();
    let orchestrator = ObserveOrchestrator::new(MemoryDialer::new(transport), settings(10));

    let err = orchestrator.run(&request()).await.unwrap_err();

    assert!(matches!(
        err,
        ObserveError::Subscription(SubscriptionError::Timeout { .. })
    ));
    assert_eq!(orchestrator.state(), OrchestratorState::Failed);
    assert!(peer.is_client_closed());
}

#[tokio::test]
async fn test_run_is_single_use() {
    let dialer = MemoryDialer::failing(HandshakeError::Timeout {
        remote: "127.0.0.1:5684".into(),
    });
    let orchestrator = ObserveOrchestrator::new(dialer, settings(1));
    let _ = orchestrator.run(&request()).await;

    assert_eq!(
        orchestrator.run(&request()).await,
        Err(ObserveError::AlreadyStarted(OrchestratorState::Failed))
    );
}

#[tokio::test]
async fn test_dropped_run_closes_session() {
    let (transport, mut peer) = memory_pair();
    let orchestrator = ObserveOrchestrator::new(MemoryDialer::new(transport), settings(10));

    let req = request();
    {
        let run = orchestrator.run(&req);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("run finished without a registration answer"),
            _ = accept_registration(&mut peer) => {}
        }
        // Let the run observe the acknowledgement, then abandon it.
        let _ = tokio::time::timeout(Duration::from_millis(50), &mut run).await;
    }

    assert!(peer.is_client_closed());
}
