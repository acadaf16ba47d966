//! # End-to-End Observation over QUIC
//!
//! Runs the orchestrator against the loopback server in `support`:
//!
//! 1. Threshold reached: 10 notifications, cancellation, session closed
//! 2. Deadline: 3 notifications, cancellation anyway, session closed
//! 3. Untrusted client certificate: handshake fails, nothing registered
//! 4. Server identity mismatch: fatal by default, accepted when verification
//!    is switched off

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use observe_core::{
        CancelOutcome, Completion, Credential, HandshakeError, ObserveConfig, ObserveError,
        ObserveOrchestrator, ObserveRequest, ObserveSettings, OrchestratorState, QuicDialer,
        ServerIdentity, SessionDialer, SessionOptions, DatagramTransport,
    };

    use crate::integration::support::{ObserveServer, ServerScript, TestCa};

    const FINISH: Duration = Duration::from_secs(10);

    fn request(server: &ObserveServer) -> ObserveRequest {
        ObserveRequest {
            host: "127.0.0.1".into(),
            port: server.addr.port(),
            path: "/obs".into(),
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_secs(5),
            ..SessionOptions::default()
        }
    }

    // =========================================================================
    // COMPLETION PATHS
    // =========================================================================

    #[tokio::test]
    async fn test_threshold_run_over_mutual_tls() {
        let ca = TestCa::new("observe test ca");
        let server_cert = ca.issue_server(&["localhost", "127.0.0.1"]);
        let client_cert = ca.issue_client("observe-client");
        let server = ObserveServer::start(&server_cert, &ca, ServerScript::default());

        // Credentials laid out the way the binary expects them.
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ca-crt.pem"), ca.pem()).unwrap();
        fs::write(dir.path().join("client1-crt.pem"), &client_cert.cert_pem).unwrap();
        fs::write(dir.path().join("client1-key.pem"), &client_cert.key_pem).unwrap();
        let config = ObserveConfig::parse(&format!(
            "[credentials]\ndir = {:?}\n",
            dir.path().display().to_string()
        ))
        .unwrap();
        let credential = Credential::load(&config.credential_paths()).unwrap();

        let orchestrator = ObserveOrchestrator::new(
            QuicDialer::new(credential, options()),
            config.observe_settings().unwrap(),
        );
        let report = orchestrator.run(&request(&server)).await.unwrap();

        assert_eq!(report.completion, Completion::ThresholdReached);
        assert_eq!(report.delivered, 10);
        assert_eq!(report.cancel, CancelOutcome::Acknowledged);
        assert_eq!(orchestrator.state(), OrchestratorState::Done);

        let seen = server.finish(FINISH).await;
        assert!(seen.handshake_error.is_none());
        assert_eq!(seen.pings, 1);
        assert_eq!(seen.registrations, vec![report.token]);
        assert_eq!(seen.cancellations, vec![report.token]);
        assert!(seen.closed_by_client);
    }

    #[tokio::test]
    async fn test_deadline_run_still_cancels_and_closes() {
        let ca = TestCa::new("observe test ca");
        let server_cert = ca.issue_server(&["127.0.0.1"]);
        let server = ObserveServer::start(
            &server_cert,
            &ca,
            ServerScript {
                notifications: 3,
                ..ServerScript::default()
            },
        );

        let settings = ObserveSettings {
            await_timeout: Duration::from_millis(800),
            ..ObserveSettings::default()
        };
        let orchestrator = ObserveOrchestrator::new(QuicDialer::new(ca.client_credential(&ca), options()), settings);
        let report = orchestrator.run(&request(&server)).await.unwrap();

        assert_eq!(report.completion, Completion::TimedOut);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.cancel, CancelOutcome::Acknowledged);
        assert_eq!(orchestrator.state(), OrchestratorState::Done);

        let seen = server.finish(FINISH).await;
        assert_eq!(seen.cancellations, vec![report.token]);
        assert!(seen.closed_by_client);
    }

    #[tokio::test]
    async fn test_unanswered_cancellation_is_bounded() {
        let ca = TestCa::new("observe test ca");
        let server_cert = ca.issue_server(&["127.0.0.1"]);
        let server = ObserveServer::start(
            &server_cert,
            &ca,
            ServerScript {
                notifications: 2,
                ack_cancel: false,
                ..ServerScript::default()
            },
        );

        let settings = ObserveSettings {
            threshold: std::num::NonZeroU64::new(2).unwrap(),
            deregister_timeout: Duration::from_millis(300),
            ..ObserveSettings::default()
        };
        let orchestrator = ObserveOrchestrator::new(QuicDialer::new(ca.client_credential(&ca), options()), settings);

        let report = tokio::time::timeout(Duration::from_secs(5), orchestrator.run(&request(&server)))
            .await
            .expect("run bounded by its deadlines")
            .unwrap();
        assert_eq!(report.completion, Completion::ThresholdReached);
        assert_eq!(report.cancel, CancelOutcome::Unacknowledged);

        let seen = server.finish(FINISH).await;
        assert_eq!(seen.cancellations.len(), 1);
        assert!(seen.closed_by_client);
    }

    // =========================================================================
    // HANDSHAKE FAILURES
    // =========================================================================

    #[tokio::test]
    async fn test_untrusted_client_certificate_fails_handshake() {
        let ca = TestCa::new("observe test ca");
        let rogue = TestCa::new("rogue ca");
        let server_cert = ca.issue_server(&["127.0.0.1"]);
        let server = ObserveServer::start(&server_cert, &ca, ServerScript::default());

        // Trusts the real CA, but presents a certificate the server does not.
        let credential = ca.client_credential(&rogue);
        let orchestrator = ObserveOrchestrator::new(QuicDialer::new(credential, options()), ObserveSettings::default());

        let err = orchestrator.run(&request(&server)).await.unwrap_err();
        assert!(matches!(err, ObserveError::Handshake(_)), "unexpected error: {}", err);
        assert_eq!(orchestrator.state(), OrchestratorState::Failed);

        let seen = server.finish(FINISH).await;
        assert!(seen.handshake_error.is_some());
        assert!(seen.registrations.is_empty());
    }

    #[tokio::test]
    async fn test_untrusted_server_fails_handshake() {
        let ca = TestCa::new("observe test ca");
        let rogue = TestCa::new("rogue ca");
        let server_cert = rogue.issue_server(&["127.0.0.1"]);
        let server = ObserveServer::start(&server_cert, &ca, ServerScript::default());

        let dialer = QuicDialer::new(
            ca.client_credential(&ca),
            SessionOptions {
                server_identity: ServerIdentity::TrustAnchorsOnly,
                ..options()
            },
        );
        let err = dialer.dial("127.0.0.1", server.addr.port()).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Rejected { .. }), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_identity_mismatch_rejected_unless_verification_disabled() {
        let ca = TestCa::new("observe test ca");
        let server_cert = ca.issue_server(&["observe.example"]);

        let strict = ObserveServer::start(&server_cert, &ca, ServerScript::default());
        let err = QuicDialer::new(ca.client_credential(&ca), options())
            .dial("127.0.0.1", strict.addr.port())
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Rejected { .. }), "unexpected error: {}", err);

        let lenient = ObserveServer::start(&server_cert, &ca, ServerScript::default());
        let session = QuicDialer::new(
            ca.client_credential(&ca),
            SessionOptions {
                server_identity: ServerIdentity::TrustAnchorsOnly,
                ..options()
            },
        )
        .dial("127.0.0.1", lenient.addr.port())
        .await
        .unwrap();
        assert!(session.close());
        assert!(!session.close());
        session.drain().await;

        let seen = lenient.finish(FINISH).await;
        assert_eq!(seen.pings, 1);
        assert!(seen.closed_by_client);
    }
}
