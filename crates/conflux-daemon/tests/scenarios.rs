use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use conflux_core::{
    audit::{AuditAction, AuditFilter, AuditOutcome, InMemoryAuditLog},
    blob::InMemoryBlobStore,
    model::{
        Action, EntryKey, EntryValue, Key, KeyVersion, Namespace, PageRequest, PolicySpec, Principal,
        Revision, SubscriberId, VersionId, VersionSelector,
    },
    CoreError,
};
use conflux_daemon::{ConfigService, PutRequest, ServiceOptions};
use conflux_rotation::{RotationOptions, RotationState};
use conflux_storage::key_provider::InMemoryKeyProvider;

fn admin() -> Principal {
    Principal::new("admin").unwrap()
}

fn billing() -> Principal {
    Principal::new("svc-billing").unwrap()
}

async fn open(options: ServiceOptions) -> (Arc<ConfigService>, InMemoryAuditLog) {
    let audit = InMemoryAuditLog::new();
    let service = ConfigService::open(
        ServiceOptions {
            bootstrap_admin: Some(admin()),
            ..options
        },
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(audit.clone()),
        Arc::new(InMemoryKeyProvider::default()),
    )
    .await
    .expect("service opens");
    (Arc::new(service), audit)
}

async fn grant(service: &ConfigService, who: &str, resource: &str, actions: &[Action]) {
    service
        .create_policy(
            &admin(),
            PolicySpec {
                principal_pattern: who.into(),
                resource_pattern: resource.into(),
                permitted_actions: actions.iter().copied().collect(),
            },
        )
        .await
        .expect("policy created");
}

#[tokio::test]
async fn specific_policy_overrides_broad_grant() {
    let (service, audit) = open(ServiceOptions::default()).await;
    grant(&service, "svc-billing", "prod/*", &[Action::Read]).await;
    grant(&service, "svc-billing", "prod/secrets/*", &[]).await;

    let app_name = EntryKey::parse("prod", "app-name").unwrap();
    let password = EntryKey::parse("prod", "secrets/db-password").unwrap();
    service
        .put(&admin(), &app_name, PutRequest::plain("billing"))
        .await
        .unwrap();
    service
        .put(&admin(), &password, PutRequest::secret("hunter2"))
        .await
        .unwrap();

    let read = service
        .get(&billing(), &app_name, VersionSelector::Latest)
        .await
        .unwrap();
    assert_eq!(read.data.as_slice(), b"billing");
    assert!(matches!(
        service
            .get(&billing(), &password, VersionSelector::Latest)
            .await,
        Err(CoreError::Denied { .. })
    ));
    assert!(matches!(
        service
            .put(&billing(), &app_name, PutRequest::plain("hijacked"))
            .await,
        Err(CoreError::Denied { .. })
    ));

    let denied: Vec<_> = audit
        .records()
        .into_iter()
        .filter(|r| matches!(r.outcome, AuditOutcome::Denied { .. }))
        .collect();
    assert_eq!(denied.len(), 2);
    assert_eq!(denied[0].principal, billing());
    assert_eq!(denied[0].action, AuditAction::Read);
    assert_eq!(denied[0].resource_path, "prod/secrets/db-password");
    assert_eq!(denied[1].action, AuditAction::Write);
}

#[tokio::test]
async fn listing_hides_keys_the_caller_cannot_read() {
    let (service, _) = open(ServiceOptions::default()).await;
    grant(&service, "svc-billing", "prod/*", &[Action::Read]).await;
    grant(&service, "svc-billing", "prod/secrets/*", &[]).await;
    let prod = Namespace::new("prod").unwrap();
    for key in ["app-name", "secrets/db-password", "timeout"] {
        service
            .put(
                &admin(),
                &EntryKey::new(prod.clone(), Key::new(key).unwrap()),
                PutRequest::plain("x"),
            )
            .await
            .unwrap();
    }

    let page = service
        .list_keys(&billing(), &prod, &PageRequest::default())
        .await
        .unwrap();
    let keys: Vec<_> = page.items.iter().map(|s| s.key.to_string()).collect();
    assert_eq!(keys, ["app-name", "timeout"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_get_gapless_versions() {
    let (service, _) = open(ServiceOptions::default()).await;
    let entry = EntryKey::parse("prod", "feature-flags").unwrap();

    let mut handles = Vec::new();
    for i in 0..24 {
        let service = Arc::clone(&service);
        let entry = entry.clone();
        handles.push(tokio::spawn(async move {
            service
                .put(&admin(), &entry, PutRequest::plain(format!("v{i}")))
                .await
                .unwrap()
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort();
    assert_eq!(ids, (1..=24).map(VersionId).collect::<Vec<_>>());

    let versions = service
        .list_versions(&admin(), &entry, &PageRequest::first(100))
        .await
        .unwrap();
    let revisions: Vec<_> = versions.items.iter().map(|v| v.revision.0).collect();
    assert_eq!(revisions, (1..=24).collect::<Vec<_>>());
}

#[tokio::test]
async fn acked_revisions_are_never_redelivered() {
    let (service, _) = open(ServiceOptions::default()).await;
    let prod = Namespace::new("prod").unwrap();
    let renderer = SubscriberId::new("renderer").unwrap();
    service
        .subscribe(&admin(), &renderer, &prod, None)
        .await
        .unwrap();

    for key in ["a", "b", "a", "c", "b"] {
        service
            .put(
                &admin(),
                &EntryKey::new(prod.clone(), Key::new(key).unwrap()),
                PutRequest::plain(key),
            )
            .await
            .unwrap();
    }
    let first = service
        .poll(&admin(), &renderer, &prod, Revision(0), Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(first.changes.len(), 5);
    assert_eq!(first.next_token, Revision(5));
    service
        .ack(&admin(), &renderer, &prod, first.next_token)
        .await
        .unwrap();

    service
        .put(
            &admin(),
            &EntryKey::parse("prod", "d").unwrap(),
            PutRequest::plain("d"),
        )
        .await
        .unwrap();
    service
        .put(
            &admin(),
            &EntryKey::parse("prod", "a").unwrap(),
            PutRequest::plain("a3"),
        )
        .await
        .unwrap();

    // An older token is clamped to the acked position.
    for since in [Revision(5), Revision(3)] {
        let next = service
            .poll(&admin(), &renderer, &prod, since, Some(Duration::ZERO))
            .await
            .unwrap();
        let revisions: Vec<_> = next.changes.iter().map(|c| c.revision).collect();
        assert_eq!(revisions, [Revision(6), Revision(7)]);
        let a = next.changes.iter().find(|c| c.key.as_str() == "a").unwrap();
        assert_eq!(a.version_id, VersionId(3));
    }

    let stale = service
        .ack(&admin(), &renderer, &prod, Revision(4))
        .await
        .unwrap_err();
    assert!(stale.is_benign());
    assert_eq!(
        service
            .coordinator()
            .subscription(&renderer, &prod)
            .await
            .unwrap()
            .last_acked,
        Revision(5)
    );
}

#[tokio::test]
async fn long_poll_wakes_on_commit() {
    let (service, _) = open(ServiceOptions::default()).await;
    let prod = Namespace::new("prod").unwrap();
    let renderer = SubscriberId::new("renderer").unwrap();
    service
        .subscribe(&admin(), &renderer, &prod, None)
        .await
        .unwrap();

    let waiter = {
        let service = Arc::clone(&service);
        let (prod, renderer) = (prod.clone(), renderer.clone());
        tokio::spawn(async move {
            service
                .poll(&admin(), &renderer, &prod, Revision(0), Some(Duration::from_secs(10)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    service
        .put(
            &admin(),
            &EntryKey::parse("prod", "app-name").unwrap(),
            PutRequest::plain("billing"),
        )
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("poll returns after the commit")
        .unwrap()
        .unwrap();
    assert!(!response.timed_out);
    assert_eq!(response.next_token, Revision(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secret_survives_master_key_rotation() {
    let options = ServiceOptions {
        rotation: RotationOptions {
            grace_period: TimeDelta::hours(1),
            ..RotationOptions::default()
        },
        ..ServiceOptions::default()
    };
    let (service, audit) = open(options).await;
    let entry = EntryKey::parse("prod", "db/password").unwrap();
    service
        .put(&admin(), &entry, PutRequest::secret("s3cr3t"))
        .await
        .unwrap();

    let EntryValue::Sealed { envelope: sealed_v1 } = service
        .store()
        .get(&entry, VersionSelector::Latest)
        .unwrap()
        .value
    else {
        panic!("secret must be sealed");
    };
    assert_eq!(sealed_v1.key_version, KeyVersion(1));

    // Readers run for the whole rotation.
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let (service, entry, done) = (Arc::clone(&service), entry.clone(), Arc::clone(&done));
        tokio::spawn(async move {
            let mut reads = 0usize;
            while !done.load(Ordering::Acquire) || reads == 0 {
                let read = service
                    .get(&admin(), &entry, VersionSelector::Latest)
                    .await
                    .expect("read during rotation");
                assert_eq!(read.data.as_slice(), b"s3cr3t");
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    let report = service.rotate_master_key(&admin()).await.unwrap();
    done.store(true, Ordering::Release);
    assert!(reader.await.unwrap() > 0);

    assert_eq!((report.from, report.to), (KeyVersion(1), KeyVersion(2)));
    assert_eq!(report.resealed, 1);
    assert_eq!(report.failed, 0);
    assert!(matches!(
        service.rotation_state(&entry),
        RotationState::ReEncrypting { from: KeyVersion(1) }
    ));

    // Every version, old ones included, now opens under v2.
    for selector in [VersionSelector::Latest, VersionSelector::At(VersionId(1))] {
        let read = service.get(&admin(), &entry, selector).await.unwrap();
        assert_eq!(read.data.as_slice(), b"s3cr3t");
    }
    assert!(service.store().versions_referencing(KeyVersion(1)).is_empty());

    // v1 still opens during the grace window and cannot be retired early.
    assert_eq!(
        service.envelopes().open(&sealed_v1).await.unwrap().as_slice(),
        b"s3cr3t"
    );
    assert!(matches!(
        service.retire_key(&admin(), KeyVersion(1)).await,
        Err(CoreError::InvalidInput(_))
    ));

    let retired = service
        .rotation()
        .retire_expired(Utc::now() + TimeDelta::hours(2), &admin())
        .await
        .expect("retirement never reports an incomplete rotation");
    assert_eq!(retired, [KeyVersion(1)]);
    assert!(matches!(
        service.envelopes().open(&sealed_v1).await,
        Err(CoreError::UnknownKeyVersion(KeyVersion(1)))
    ));
    assert_eq!(service.rotation_state(&entry), RotationState::Stable);

    let read = service
        .get(&admin(), &entry, VersionSelector::Latest)
        .await
        .unwrap();
    assert_eq!(read.data.as_slice(), b"s3cr3t");

    let actions: Vec<_> = audit.records().into_iter().map(|r| r.action).collect();
    assert!(actions.contains(&AuditAction::KeyRotate));
    assert!(actions.contains(&AuditAction::ReEncrypt));
    assert!(actions.contains(&AuditAction::KeyRetire));
}

#[tokio::test]
async fn audit_export_pages_through_filtered_records() {
    let (service, _) = open(ServiceOptions::default()).await;
    let entry = EntryKey::parse("prod", "app-name").unwrap();
    for i in 0..5 {
        service
            .put(&admin(), &entry, PutRequest::plain(format!("{i}")))
            .await
            .unwrap();
    }
    assert!(matches!(
        service
            .export_audit(&billing(), &AuditFilter::default(), &PageRequest::first(10))
            .await,
        Err(CoreError::Denied { .. })
    ));

    let filter = AuditFilter {
        action: Some(AuditAction::Write),
        resource_prefix: Some("prod/".into()),
        ..AuditFilter::default()
    };
    let mut page = PageRequest::first(2);
    let mut seqs = Vec::new();
    loop {
        let batch = service.export_audit(&admin(), &filter, &page).await.unwrap();
        assert!(batch.items.len() <= 2);
        seqs.extend(batch.items.iter().map(|r| r.seq));
        match batch.next {
            Some(cursor) => page = PageRequest::after(cursor, 2),
            None => break,
        }
    }
    assert_eq!(seqs.len(), 5);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}
