//! Security tests: replay protection, message certification, session
//! encryption, secret-key answers and single-winner races.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hs_core::crypto::{generate_rsa_key, CipherAlgorithm, HashAlgorithm};
use hs_core::{ErrorKind, Handle};
use hs_net::auth::{secret_key_answer, verify_secret_key_answer};
use hs_net::session::{open, seal, ReplayWindow, REPLAY_WINDOW_SIZE};
use hs_net::{race, Lane, SessionError, SessionKey};
use hs_proto::{Body, HandleValue, Message, Opcode, ProtocolVersion, ResponseCode, ValueReference};
use rand::Rng;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hs_tests=debug,hs_net=debug")
        .with_test_writer()
        .try_init();
}

fn resolution(handle: &str) -> Message {
    Message::request(
        Opcode::Resolution,
        Body::Handle {
            handle: Handle::from(handle),
        },
    )
}

// ============================================================================
// Replay protection
// ============================================================================

#[test]
fn test_replay_window_rejects_repeats() {
    let mut window = ReplayWindow::new();
    for counter in 1..=(REPLAY_WINDOW_SIZE as u32 + 1) {
        window.check(counter).unwrap();
    }
    assert_eq!(window.len(), REPLAY_WINDOW_SIZE);

    // Seen and still remembered.
    assert!(matches!(window.check(150), Err(SessionError::DuplicateCounter(150))));
    // Evicted: older than anything the window can vouch for.
    assert!(matches!(window.check(1), Err(SessionError::DuplicateCounter(1))));
    // New counters keep flowing.
    window.check(500).unwrap();
    assert!(window.check(500).is_err());
}

#[test]
fn test_replay_window_accepts_out_of_order() {
    let mut window = ReplayWindow::new();
    for counter in [5, 3, 9, 1, 2] {
        window.check(counter).unwrap();
    }
    for counter in [5, 3, 9, 1, 2] {
        assert!(window.check(counter).is_err());
    }
}

// ============================================================================
// Certified messages
// ============================================================================

#[test]
fn test_certified_response_verification() {
    let key = generate_rsa_key(1024).unwrap();
    let other = generate_rsa_key(1024).unwrap();
    let request = resolution("10.1/a");
    let mut response = Message::response_to(
        &request,
        ResponseCode::Success,
        Body::Values {
            handle: Handle::from("10.1/a"),
            values: vec![HandleValue::new(1, "URL", "https://a")],
        },
    );
    response
        .sign(&key, ValueReference::new("0.NA/10.1", 300))
        .unwrap();

    response.verify_signature(&key.public_key()).unwrap();
    let err = response.verify_signature(&other.public_key()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityAlert);

    let mut tampered = response.clone();
    tampered.body = Body::Values {
        handle: Handle::from("10.1/a"),
        values: vec![HandleValue::new(1, "URL", "https://evil")],
    };
    assert!(tampered.verify_signature(&key.public_key()).is_err());

    let unsigned = resolution("10.1/a");
    let err = unsigned.verify_signature(&key.public_key()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingOrInvalidSignature);
}

// ============================================================================
// Session encryption
// ============================================================================

#[test]
fn test_sealed_frames_need_the_session_key() {
    let key = SessionKey::generate(CipherAlgorithm::Aes);
    let request = resolution("10.1/secret");

    let frame = seal(&request, Some(&key), true).unwrap();
    assert!(frame.envelope.is_encrypted());
    let opened = open(frame.clone(), Some(&key)).unwrap();
    assert_eq!(opened.opcode, request.opcode);
    assert_eq!(opened.body, request.body);

    assert!(open(frame.clone(), None).is_err());
    let wrong = SessionKey::generate(CipherAlgorithm::Aes);
    assert!(open(frame, Some(&wrong)).is_err());

    assert!(seal(&request, None, true).is_err());
    let plain = seal(&request, None, false).unwrap();
    assert!(!plain.envelope.is_encrypted());
    assert_eq!(open(plain, None).unwrap().body, request.body);
}

// ============================================================================
// Secret-key answers
// ============================================================================

#[test]
fn test_secret_key_answers_across_versions() {
    let nonce = [0u8; 16];
    let digest = HashAlgorithm::Sha256.digest(b"test");
    let pinned = [
        (ProtocolVersion::new(2, 7), "22728232470d7943cd23cbff870187fb998976cb3c"),
        (ProtocolVersion::new(2, 5), "12eed1ff0bbfd2c2a7cd3dd7b13b88ae6c836c458a"),
        (ProtocolVersion::new(2, 0), "011c8c6cf1067e2aa15d6bf66d6e7407"),
    ];
    for (version, expected) in pinned {
        let answer = secret_key_answer(version, b"password", &nonce, &digest);
        assert_eq!(hex::encode(&answer), expected, "version {version}");
        assert!(verify_secret_key_answer(b"password", &nonce, &digest, &answer));
        assert!(!verify_secret_key_answer(b"Password", &nonce, &digest, &answer));
        assert!(!verify_secret_key_answer(b"password", &[1u8; 16], &digest, &answer));
    }
}

// ============================================================================
// Racing
// ============================================================================

#[tokio::test]
async fn test_race_has_exactly_one_winner() {
    init_tracing();
    for _ in 0..1000 {
        let finished = Arc::new(AtomicUsize::new(0));
        let lanes: Vec<Lane<usize>> = (0..3)
            .map(|i| {
                let delay = Duration::from_micros(rand::thread_rng().gen_range(0..500));
                let finished = finished.clone();
                Lane::new(format!("lane-{i}")).attempt(move |_| async move {
                    tokio::time::sleep(delay).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                })
            })
            .collect();
        let winner = race(lanes).await.unwrap();
        assert_eq!(winner.lane, format!("lane-{}", winner.value));
        assert!(finished.load(Ordering::SeqCst) >= 1);
    }
}

#[tokio::test]
async fn test_race_reports_most_relevant_error() {
    init_tracing();
    let refused = Lane::new("refused").attempt(|_| async {
        Err::<(), _>(hs_core::HandleError::new(ErrorKind::CannotConnectToServer, "refused"))
    });
    let denied = Lane::new("denied").attempt(|_| async {
        Err::<(), _>(hs_core::HandleError::new(ErrorKind::UnableToAuthenticate, "denied"))
    });
    let err = race(vec![refused, denied]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnableToAuthenticate);
}
