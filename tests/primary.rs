//! CA lifecycle in the primary datacenter.

mod common;

use std::collections::BTreeMap;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use meshca::api::{CaRequest, CaRoot, CaSignRequest, ProviderState};
use meshca::commons::crypto::{self, KeyType, SpiffeId, Validity};
use meshca::commons::error::Error;
use meshca::config::Config;
use meshca::server::{CaEvent, CaState, CaStateAccess};
use common::*;

async fn primary() -> (TestCluster, TestDc) {
    let cluster = TestCluster::new();
    let dc1 = cluster.add_dc("dc1", "dc1");
    dc1.manager.initialize(&CancellationToken::new()).await.unwrap();
    (cluster, dc1)
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let (_cluster, dc1) = primary().await;
    let root = dc1.active_root();
    assert!(root.active);
    assert_eq!(root.intermediate_certs.len(), 1);

    // The signing snapshot is the root as committed.
    assert_eq!((root.create_index, root.modify_index), (1, 1));
    assert_eq!(dc1.store.active_root().unwrap(), Some(root.clone()));
    assert!(!dc1.manager.configuration().unwrap().cluster_id.is_empty());

    dc1.manager.initialize(&CancellationToken::new()).await.unwrap();
    assert_eq!(dc1.store.apply_count(), 1);
    assert_eq!(dc1.effects.count(GENERATE_INTERMEDIATE), 1);
    assert_eq!(dc1.active_root(), root);
}

#[tokio::test]
async fn operations_need_initialization() {
    let cluster = TestCluster::new();
    let dc1 = cluster.add_dc("dc1", "dc1");
    let ctx = CancellationToken::new();

    assert!(matches!(
        dc1.manager.renew_intermediate(&ctx, true).await,
        Err(Error::NotInitialized)
    ));
    let config = Config::test_config("dc1", "dc1").ca;
    assert!(matches!(
        dc1.manager.update_configuration(&ctx, config).await,
        Err(Error::NotInitialized)
    ));
    assert_eq!(dc1.manager.state(), CaState::Uninitialized);
}

#[tokio::test]
async fn update_during_renewal_is_busy() {
    let (_cluster, dc1) = primary().await;
    let config = dc1.manager.configuration().unwrap();

    dc1.gate.arm(APPLY);
    let manager = dc1.manager.clone();
    let renewal = tokio::spawn(async move {
        manager.renew_intermediate(&CancellationToken::new(), true).await
    });
    dc1.gate.entered().await;
    assert_eq!(dc1.manager.state(), CaState::RenewingIntermediate);

    let before = dc1.effects.len();
    let err = dc1.manager
        .update_configuration(
            &CancellationToken::new(), with_key_bits(&config, 384)
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Busy(CaState::RenewingIntermediate)),
        "unexpected error: {}", err
    );
    assert!(err.is_busy());
    assert_eq!(dc1.effects.len(), before);

    dc1.gate.release();
    renewal.await.unwrap().unwrap();
    assert_eq!(dc1.manager.state(), CaState::Initialized);
}

#[tokio::test]
async fn failed_apply_is_returned_and_state_restored() {
    let cluster = TestCluster::new();
    let dc1 = cluster.add_dc("dc1", "dc1");

    dc1.store.fail_applies(true);
    let err = dc1.manager
        .initialize(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Apply(_)), "unexpected error: {}", err);
    assert_eq!(dc1.manager.state(), CaState::Uninitialized);
    assert!(dc1.manager.active_root().is_none());

    dc1.store.fail_applies(false);
    dc1.manager.initialize(&CancellationToken::new()).await.unwrap();
    let before = dc1.active_root();

    dc1.store.fail_applies(true);
    let err = dc1.manager
        .renew_intermediate(&CancellationToken::new(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Apply(_)));
    assert_eq!(dc1.manager.state(), CaState::Initialized);
    assert_eq!(dc1.active_root(), before);
}

#[tokio::test]
async fn expired_material_is_named() {
    let (cluster, dc1) = primary().await;
    let id = dc1.service_id("web");
    let csr = leaf_csr(&id);

    cluster.clock.advance(Duration::hours(73));
    let err = dc1.manager.sign_certificate(&csr, &id).await.unwrap_err();
    assert!(
        err.to_string().starts_with("intermediate expired: certificate expired"),
        "unexpected error: {}", err
    );

    cluster.clock.advance(Duration::days(11 * 366));
    let err = dc1.manager.sign_certificate(&csr, &id).await.unwrap_err();
    assert!(
        err.to_string().starts_with("root expired: certificate expired"),
        "unexpected error: {}", err
    );
}

#[tokio::test]
async fn not_yet_valid_material_is_accepted() {
    let (cluster, dc1) = primary().await;
    let id = dc1.service_id("web");

    cluster.clock.advance(Duration::days(-1));
    let issued = dc1.manager.sign_certificate(&leaf_csr(&id), &id).await.unwrap();
    assert_eq!(issued.service.as_deref(), Some("web"));
}

#[tokio::test]
async fn leaf_chain_verifies_and_is_reported() {
    let (_cluster, dc1) = primary().await;
    let id = dc1.service_id("db");

    let issued = dc1.endpoint
        .sign(CaSignRequest::new("", leaf_csr(&id)))
        .await
        .unwrap();
    assert_eq!(issued.service_uri.as_deref(), Some(id.to_string().as_str()));
    assert!(issued.agent.is_none());
    assert!(issued.valid_before > issued.valid_after);

    let root = dc1.active_root();
    assert!(crypto::verify_chain(&root.root_cert, &[], &issued.cert_pem).unwrap());
    assert!(dc1.observer.events().contains(&CaEvent::PostSign {
        signing_key_id: root.signing_key_id.clone(),
    }));
}

#[tokio::test]
async fn foreign_identities_are_rejected() {
    let (_cluster, dc1) = primary().await;
    let td = dc1.manager.configuration().unwrap().trust_domain();

    let other_dc = crypto::SpiffeId::service(td.as_str(), "default", "dc9", "web");
    let err = dc1.manager
        .sign_certificate(&leaf_csr(&other_dc), &other_dc)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpiffeIdRejected(_)));

    let other_td = crypto::SpiffeId::service("other.mesh", "default", "dc1", "web");
    let err = dc1.manager
        .sign_certificate(&leaf_csr(&other_td), &other_td)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpiffeIdRejected(_)));

    // The CSR must actually ask for the identity.
    let web = dc1.service_id("web");
    let api = dc1.service_id("api");
    let err = dc1.manager
        .sign_certificate(&leaf_csr(&web), &api)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpiffeIdRejected(_)));
}

#[tokio::test]
async fn csr_must_not_carry_extra_identities() {
    let (_cluster, dc1) = primary().await;
    let web = dc1.service_id("web");
    let foreign = SpiffeId::service("evil.mesh", "default", "dc9", "admin");
    let csr = multi_id_csr(&[&web, &foreign]);

    let err = dc1.manager.sign_certificate(&csr, &web).await.unwrap_err();
    assert!(
        matches!(err, Error::SpiffeIdRejected(_)),
        "unexpected error: {}", err
    );
    let err = dc1.endpoint
        .sign(CaSignRequest::new("", csr))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCsr(_)), "unexpected error: {}", err);

    let twice = multi_id_csr(&[&web, &web]);
    assert!(dc1.manager.sign_certificate(&twice, &web).await.is_err());
    assert_eq!(dc1.effects.count("provider/Sign"), 0);
}

#[tokio::test]
async fn renewal_waits_for_the_deadline() {
    let (cluster, dc1) = primary().await;
    let ctx = CancellationToken::new();
    let first = dc1.active_root().signing_key_id;

    dc1.manager.renew_intermediate(&ctx, false).await.unwrap();
    assert_eq!(dc1.store.apply_count(), 1);

    // Half of the 72h lifetime, minus the drift buffer.
    cluster.clock.advance(Duration::hours(36));
    dc1.manager.renew_intermediate(&ctx, false).await.unwrap();
    assert_eq!(dc1.store.apply_count(), 2);

    let root = dc1.active_root();
    assert_ne!(root.signing_key_id, first);
    assert_eq!(root.intermediate_certs.len(), 2);
    assert_eq!((root.create_index, root.modify_index), (1, 2));

    // Once the first intermediate expired, it is pruned on renewal.
    cluster.clock.advance(Duration::hours(37));
    dc1.manager.renew_intermediate(&ctx, true).await.unwrap();
    assert_eq!(dc1.active_root().intermediate_certs.len(), 2);
}

#[tokio::test]
async fn csr_limit_admits_sequential_requests() {
    let cluster = TestCluster::new();
    let dc1 = cluster.add_dc_with("dc1", "dc1", |settings| {
        settings.csr_max_concurrent = 1;
    });
    dc1.manager.initialize(&CancellationToken::new()).await.unwrap();

    // Sequential requests each get the single permit.
    let id = dc1.service_id("web");
    for _ in 0..3 {
        dc1.manager.sign_certificate(&leaf_csr(&id), &id).await.unwrap();
    }
}


//------------ Expiry of seeded material -------------------------------------

const SEEDED_CLUSTER: &str = "11111111-2222-3333-4444-555555555555";

/// Commits a root and a signing intermediate with the given validity
/// periods for dc1 and initializes its manager on top of them.
async fn seeded(
    root_validity: Validity,
    intermediate_validity: Validity,
) -> (TestCluster, TestDc) {
    let cluster = TestCluster::new();
    let dc1 = cluster.add_dc("dc1", "dc1");
    let signing = SpiffeId::signing(SEEDED_CLUSTER).to_string();

    let root_key = crypto::generate_private_key(KeyType::Ec, 256).unwrap();
    let root_cert = crypto::create_root(
        &root_key, "seeded-root", &signing, root_validity
    ).unwrap();
    let int_key = crypto::generate_private_key(KeyType::Ec, 256).unwrap();
    let int_csr = crypto::create_ca_csr(&int_key, "seeded-ica", &signing).unwrap();
    let int_cert = crypto::sign_ca_csr(
        &root_cert, &root_key, &int_csr, intermediate_validity
    ).unwrap();

    let root_pem = crypto::cert_to_pem(&root_cert).unwrap();
    let int_pem = crypto::cert_to_pem(&int_cert).unwrap();
    let mut root = CaRoot::from_root_pem(&root_pem).unwrap();
    root.push_intermediate(&int_pem).unwrap();

    let mut config = Config::test_config("dc1", "dc1").ca;
    config.cluster_id = SEEDED_CLUSTER.into();
    let data = BTreeMap::from([
        ("root_key".to_string(), crypto::private_key_to_pem(&root_key).unwrap()),
        ("root_cert".to_string(), root_pem),
        ("intermediate_key".to_string(), crypto::private_key_to_pem(&int_key).unwrap()),
        ("intermediate_cert".to_string(), int_pem),
    ]);
    let response = dc1.store.memory()
        .apply_ca_request(CaRequest::SetRoots {
            index: 0,
            roots: vec![root],
            config: Some(config),
            provider_state: Some(ProviderState::new("builtin-dc1", data)),
        })
        .await
        .unwrap();
    assert!(response.applied);

    dc1.manager.initialize(&CancellationToken::new()).await.unwrap();
    assert_eq!(dc1.effects.count(GENERATE_INTERMEDIATE), 0);
    assert_eq!(dc1.store.apply_count(), 1);
    (cluster, dc1)
}

#[tokio::test]
async fn expiry_of_root_and_intermediate_is_checked_separately() {
    let now = Utc::now();
    let days = |from: i64, to: i64| {
        Validity::new(now + Duration::days(from), now + Duration::days(to))
    };
    let cases = [
        ("both valid", days(-1, 2), days(-1, 2), None),
        (
            "intermediate expired", days(-1, 2), days(-730, -1),
            Some("intermediate expired: certificate expired, expiration date"),
        ),
        (
            "root expired", days(-730, -1), days(-1, 2),
            Some("root expired: certificate expired, expiration date"),
        ),
        ("intermediate not yet valid", days(-1, 2), days(1, 2), None),
        ("root not yet valid", days(1, 2), days(-1, 2), None),
    ];

    for (name, root_validity, int_validity, expected) in cases {
        let (cluster, dc1) = seeded(root_validity, int_validity).await;
        cluster.clock.set(now);

        let id = dc1.service_id("web");
        let res = dc1.manager.sign_certificate(&leaf_csr(&id), &id).await;
        match (res, expected) {
            (Ok(issued), None) => {
                assert_eq!(issued.service.as_deref(), Some("web"), "{}", name);
            }
            (Err(err), Some(prefix)) => {
                assert!(
                    err.to_string().starts_with(prefix),
                    "{}: unexpected error: {}", name, err
                );
            }
            (Ok(_), Some(prefix)) => {
                panic!("{}: signed, expected '{}'", name, prefix)
            }
            (Err(err), None) => panic!("{}: unexpected error: {}", name, err),
        }
    }
}
