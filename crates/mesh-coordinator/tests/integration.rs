//! Integration Tests for the Mesh Coordinator
//!
//! These tests drive the coordinator through whole lifecycles:
//! - Manifest installation and fingerprinting
//! - Marble activation with generated secrets
//! - Activation limits under concurrency
//! - Sealing, restart and recovery through holder shares

use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};

use mesh_core::{Manifest, Marble, Package, QuoteReport, Secret};
use mesh_coordinator::{
    ActivationRequest, Coordinator, CoordinatorConfig, CoordinatorError, FileStore, MemoryStore,
    SealMode, SealedStateStore, State,
};

// =============================================================================
// Test Helpers
// =============================================================================

/// Recovery holder keys, generated once per test binary
fn holder_keys() -> &'static [RsaPrivateKey] {
    static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        (0..2)
            .map(|_| RsaPrivateKey::new(&mut OsRng, 2048).expect("Failed to generate holder key"))
            .collect()
    })
}

fn holder_pem(index: usize) -> String {
    RsaPublicKey::from(&holder_keys()[index])
        .to_public_key_pem(LineEnding::LF)
        .expect("Failed to encode holder key")
}

fn config(seal_mode: SealMode) -> CoordinatorConfig {
    CoordinatorConfig {
        seal_mode,
        ..Default::default()
    }
}

/// One debug package, one 256-bit `token` and a marble `svc` that needs it
fn token_manifest(max_activations: u32) -> Manifest {
    let mut m = Manifest::default();
    m.packages.insert(
        "pkg".into(),
        Package {
            debug: true,
            ..Default::default()
        },
    );
    m.secrets.insert("token".into(), Secret::symmetric(256));
    let mut marble = Marble {
        package: "pkg".into(),
        max_activations,
        ..Default::default()
    };
    marble
        .parameters
        .env
        .insert("TOKEN".into(), "{{ raw .Secrets.token }}".into());
    m.marbles.insert("svc".into(), marble);
    m
}

fn with_holders(mut m: Manifest) -> Manifest {
    m.recovery_keys.insert("alice".into(), holder_pem(0));
    m.recovery_keys.insert("bob".into(), holder_pem(1));
    m
}

fn request(marble_type: &str, id: &str) -> ActivationRequest {
    ActivationRequest {
        marble_type: marble_type.into(),
        instance_id: id.into(),
        quote: b"anything".to_vec(),
        csr: None,
    }
}

fn decrypt_share(index: usize, data: &[u8]) -> Vec<u8> {
    holder_keys()[index]
        .decrypt(Oaep::new::<Sha256>(), data)
        .expect("Holder failed to decrypt recovery data")
}

// =============================================================================
// Activation
// =============================================================================

#[test]
fn test_debug_package_activation_gets_token() {
    let c = Coordinator::new(config(SealMode::Disabled));
    c.start().unwrap();
    c.set_manifest(token_manifest(0)).unwrap();

    let resp = c.activate(request("svc", "i1")).unwrap();
    assert_eq!(resp.instance_id, "i1");
    assert_eq!(resp.secrets["token"].len(), 32);

    let status = c.get_status();
    assert_eq!(status.state, State::AcceptingMarbles);
    assert_eq!(status.active_marbles, 1);
    assert_eq!(status.stats.activation_count, 1);
    assert!(status.stats.last_activation.is_some());
}

#[test]
fn test_every_instance_gets_the_same_secret() {
    let c = Coordinator::new(config(SealMode::Disabled));
    c.start().unwrap();
    c.set_manifest(token_manifest(0)).unwrap();

    let a = c.activate(request("svc", "a")).unwrap();
    let b = c.activate(request("svc", "b")).unwrap();
    assert_eq!(a.secrets["token"], b.secrets["token"]);
    assert_eq!(
        c.get_secrets(&["token".to_string()]).unwrap()["token"],
        a.secrets["token"]
    );
}

#[test]
fn test_activation_limit_under_concurrency() {
    const LIMIT: usize = 3;
    let c = Coordinator::new(config(SealMode::Disabled));
    c.start().unwrap();
    c.set_manifest(token_manifest(LIMIT as u32)).unwrap();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..LIMIT + 1)
            .map(|_| s.spawn(|| c.activate(request("svc", ""))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ids: HashSet<String> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|r| r.instance_id.clone())
        .collect();
    assert_eq!(ids.len(), LIMIT);

    let rejected: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(rejected.len(), 1);
    assert!(matches!(
        rejected[0],
        CoordinatorError::MaxActivationsExceeded { limit: 3, .. }
    ));

    let live: HashSet<String> = c.list_instances().into_iter().map(|i| i.instance_id).collect();
    assert_eq!(live, ids);
}

#[test]
fn test_failed_quote_counts_and_leaves_instances() {
    let c = Coordinator::new(config(SealMode::Disabled));
    c.start().unwrap();

    let package = Package {
        signer_id: Some("ab".repeat(32)),
        product_id: Some(7),
        security_version: Some(2),
        ..Default::default()
    };
    let mut m = token_manifest(0);
    m.packages.insert("pkg".into(), package.clone());
    c.set_manifest(m).unwrap();

    let mut forged = QuoteReport::for_package(&package);
    forged.signer_id = "cd".repeat(32);
    let mut req = request("svc", "bad");
    req.quote = forged.to_bytes();

    assert!(matches!(
        c.activate(req),
        Err(CoordinatorError::QuoteVerificationFailed(_))
    ));
    let status = c.get_status();
    assert_eq!(status.stats.failed_activations, 1);
    assert_eq!(status.active_marbles, 0);

    let mut req = request("svc", "good");
    req.quote = QuoteReport::for_package(&package).with_report_data(b"nonce").to_bytes();
    c.activate(req).unwrap();
    assert_eq!(c.get_status().active_marbles, 1);
}

// =============================================================================
// Manifest
// =============================================================================

#[test]
fn test_second_manifest_rejected() {
    let c = Coordinator::new(config(SealMode::Disabled));
    c.start().unwrap();
    c.set_manifest(token_manifest(0)).unwrap();

    let err = c.set_manifest(token_manifest(5)).unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::InvalidState {
            state: State::AcceptingMarbles,
            ..
        }
    ));
    assert_eq!(err.kind(), "InvalidStateForOperation");
}

#[test]
fn test_fingerprint_tracks_content() {
    let a = Coordinator::new(config(SealMode::Disabled));
    a.start().unwrap();
    a.set_manifest(token_manifest(2)).unwrap();

    let b = Coordinator::new(config(SealMode::Disabled));
    b.start().unwrap();
    b.set_manifest(token_manifest(2)).unwrap();

    let c = Coordinator::new(config(SealMode::Disabled));
    c.start().unwrap();
    c.set_manifest(token_manifest(3)).unwrap();

    let (_, fa) = a.get_manifest().unwrap();
    let (_, fb) = b.get_manifest().unwrap();
    let (_, fc) = c.get_manifest().unwrap();
    assert_eq!(fa, fb);
    assert_ne!(fa, fc);
    assert_eq!(fa.len(), 64);
    assert_eq!(a.get_status().manifest_fingerprint, Some(fa));
}

// =============================================================================
// Sealing and Recovery
// =============================================================================

#[test]
fn test_recovery_with_two_holders() {
    let store = Arc::new(MemoryStore::new());
    let cfg = CoordinatorConfig {
        recovery_threshold: 2,
        ..config(SealMode::ProductKey)
    };

    let first = Coordinator::new(cfg.clone()).with_store(store.clone());
    first.start().unwrap();
    let data = first.set_manifest(with_holders(token_manifest(0))).unwrap();
    assert_eq!(data.len(), 2);

    let share_a = decrypt_share(0, &data["alice"]);
    let share_b = decrypt_share(1, &data["bob"]);
    assert_eq!(share_a.len(), 32);
    assert_eq!(share_a, share_b);

    let token = first.activate(request("svc", "i1")).unwrap().secrets["token"].to_vec();
    let (_, fingerprint) = first.get_manifest().unwrap();
    first.stop().unwrap();

    // No platform key: the restarted coordinator waits for holders
    let second = Coordinator::new(cfg).with_store(store);
    assert_eq!(second.start().unwrap(), State::Recovery);
    assert_eq!(
        second.get_status().recovery_key_holders,
        vec!["alice".to_string(), "bob".to_string()]
    );
    assert!(matches!(
        second.activate(request("svc", "i2")),
        Err(CoordinatorError::InvalidState { .. })
    ));

    let mut shares = BTreeMap::new();
    shares.insert("alice".to_string(), share_a.clone());
    assert!(matches!(
        second.recover(&shares),
        Err(CoordinatorError::RecoveryInsufficientShares { got: 1, need: 2 })
    ));
    assert_eq!(second.state(), State::Recovery);

    shares.insert("bob".to_string(), share_b);
    second.recover(&shares).unwrap();
    assert_eq!(second.state(), State::AcceptingMarbles);
    assert_eq!(second.get_manifest().unwrap().1, fingerprint);

    // Secrets survive the restart; instances do not
    assert!(second.list_instances().is_empty());
    let resp = second.activate(request("svc", "i1")).unwrap();
    assert_eq!(resp.secrets["token"].to_vec(), token);
}

#[test]
fn test_platform_key_restores_without_recovery() {
    let store = Arc::new(MemoryStore::new());
    let cfg = CoordinatorConfig {
        platform_seal_key: Some(zeroize::Zeroizing::new([0x42; 32])),
        simulation_mode: true,
        ..config(SealMode::UniqueKey)
    };

    let first = Coordinator::new(cfg.clone()).with_store(store.clone());
    first.start().unwrap();
    first.set_manifest(token_manifest(0)).unwrap();
    let root_before = first.get_quote(b"n").unwrap().root_ca;
    let token = first.get_secrets(&["token".to_string()]).unwrap()["token"].to_vec();
    first.stop().unwrap();
    assert!(store.load().unwrap().is_some());

    let second = Coordinator::new(cfg).with_store(store);
    assert_eq!(second.start().unwrap(), State::AcceptingMarbles);
    assert_eq!(
        second.get_secrets(&["token".to_string()]).unwrap()["token"].to_vec(),
        token
    );
    // Root CA carries over so issued certificates keep verifying
    assert_eq!(second.get_quote(b"n").unwrap().root_ca, root_before);
}

#[test]
fn test_user_secret_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let cfg = CoordinatorConfig {
        platform_seal_key: Some(zeroize::Zeroizing::new([0x07; 32])),
        simulation_mode: true,
        ..config(SealMode::ProductKey)
    };

    let mut m = token_manifest(0);
    m.secrets.insert("password".into(), Secret::user_plain());

    let first = Coordinator::new(cfg.clone()).with_store(store.clone());
    first.start().unwrap();
    first.set_manifest(m).unwrap();
    first.set_secret("password", b"hunter2").unwrap();
    first.stop().unwrap();

    let second = Coordinator::new(cfg).with_store(store);
    second.start().unwrap();
    assert_eq!(
        second.get_secrets(&["password".to_string()]).unwrap()["password"].as_slice(),
        b"hunter2"
    );
}

#[test]
fn test_file_store_restart() {
    let dir = std::env::temp_dir().join(format!("mesh-coordinator-it-{}", uuid::Uuid::new_v4()));
    let cfg = CoordinatorConfig {
        platform_seal_key: Some(zeroize::Zeroizing::new([0x99; 32])),
        ..config(SealMode::ProductKey)
    };

    let first = Coordinator::new(cfg.clone()).with_store(Arc::new(FileStore::new(&dir).unwrap()));
    first.start().unwrap();
    first.set_manifest(token_manifest(0)).unwrap();
    let (_, fingerprint) = first.get_manifest().unwrap();
    first.stop().unwrap();

    let second = Coordinator::new(cfg).with_store(Arc::new(FileStore::new(&dir).unwrap()));
    assert_eq!(second.start().unwrap(), State::AcceptingMarbles);
    assert_eq!(second.get_manifest().unwrap().1, fingerprint);

    second.stop().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_disabled_sealing_starts_fresh() {
    let store = Arc::new(MemoryStore::new());
    let first = Coordinator::new(config(SealMode::Disabled)).with_store(store.clone());
    first.start().unwrap();
    first.set_manifest(token_manifest(0)).unwrap();
    first.stop().unwrap();
    assert!(store.load().unwrap().is_none());

    let second = Coordinator::new(config(SealMode::Disabled)).with_store(store);
    assert_eq!(second.start().unwrap(), State::AcceptingManifest);
}
