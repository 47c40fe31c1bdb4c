use strata_common::ErrorKind;
use strata_config::{MonitoringConfig, RepositoryFactoryConfig, RepositoryOptions};
use strata_db::repositories::device_registration::{self, DeviceRegistration, DeviceRegistrationMapper};
use strata_db::repositories::DeviceRegistrationRepository;
use strata_db::{DbClient, QueryOptions, RepositoryContext, RepositoryFactory};

async fn setup(options: RepositoryOptions) -> DeviceRegistrationRepository {
    strata_common::logging::init_with_level(tracing::Level::DEBUG);
    let client = DbClient::from_url("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    device_registration::init_schema(&client)
        .await
        .expect("Failed to create schema");

    let context = RepositoryContext::new(client, MonitoringConfig::default());
    DeviceRegistrationRepository::new(
        device_registration::ENTITY_NAME,
        device_registration::device_registrations_table(),
        DeviceRegistrationMapper,
        options,
        &context,
    )
    .expect("Failed to build repository")
}

#[tokio::test]
async fn test_register_device_refreshes_existing_token() {
    let repository = setup(RepositoryOptions::default()).await;

    let first = repository
        .register_device(DeviceRegistration::new("user-1", "phone", "token-1"))
        .await
        .expect("register");
    let second = repository
        .register_device(DeviceRegistration::new("user-1", "phone", "token-2"))
        .await
        .expect("re-register");

    assert_eq!(second.id, first.id);
    assert_eq!(second.registration_token, "token-2");
    assert_eq!(second.created_at, first.created_at);

    let all = repository.find_by_user("user-1").await.expect("find");
    assert_eq!(all, vec![second]);
}

#[tokio::test]
async fn test_find_by_user_only_returns_that_user() {
    let repository = setup(RepositoryOptions::default()).await;
    for (user, device) in [("user-1", "phone"), ("user-1", "tablet"), ("user-2", "phone")] {
        repository
            .register_device(DeviceRegistration::new(user, device, format!("{}-{}", user, device)))
            .await
            .expect("register");
    }

    let mut devices: Vec<String> = repository
        .find_by_user("user-1")
        .await
        .expect("find")
        .into_iter()
        .map(|r| r.device_id)
        .collect();
    devices.sort();
    assert_eq!(devices, vec!["phone", "tablet"]);

    let found = repository
        .find_by_user_and_device("user-2", "phone")
        .await
        .expect("find")
        .expect("registered");
    assert_eq!(found.registration_token, "user-2-phone");
    assert!(repository
        .find_by_user_and_device("user-2", "tablet")
        .await
        .expect("find")
        .is_none());
}

#[tokio::test]
async fn test_device_can_be_registered_again_after_soft_delete() {
    let options = RepositoryOptions {
        soft_delete: true,
        ..RepositoryOptions::default()
    };
    let repository = setup(options).await;

    let first = repository
        .register_device(DeviceRegistration::new("user-1", "phone", "token-1"))
        .await
        .expect("register");
    repository.delete(&first.id).await.expect("delete");
    assert!(repository.find_by_user("user-1").await.expect("find").is_empty());

    let second = repository
        .register_device(DeviceRegistration::new("user-1", "phone", "token-2"))
        .await
        .expect("re-register after delete");
    assert_ne!(second.id, first.id);
    assert_eq!(repository.find_by_user("user-1").await.expect("find"), vec![second.clone()]);

    // The tombstone is kept, the live pair is still unique
    let all = QueryOptions::new().including_deleted();
    assert_eq!(repository.count(&all).await.expect("count"), 2);

    let duplicate = DeviceRegistration::new("user-1", "phone", "token-3");
    let err = repository.create(duplicate).await.expect_err("live duplicate");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.code(), "UNIQUE_CONSTRAINT_VIOLATION");
}

#[tokio::test]
async fn test_blank_token_is_rejected() {
    let repository = setup(RepositoryOptions::default()).await;

    let err = repository
        .register_device(DeviceRegistration::new("user-1", "phone", "  "))
        .await
        .expect_err("blank token");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.fields()[0].field, "registration_token");
}

#[tokio::test]
async fn test_factory_builds_device_registration_repository() {
    strata_common::logging::init_with_level(tracing::Level::DEBUG);
    let client = DbClient::from_url("sqlite::memory:").await.expect("client");
    device_registration::init_schema(&client).await.expect("schema");

    let factory = RepositoryFactory::new(client, RepositoryFactoryConfig::default());
    factory.register(device_registration::registration());
    let repository = factory
        .create::<DeviceRegistrationMapper>(device_registration::ENTITY_NAME, None)
        .expect("create");

    let saved = repository
        .register_device(DeviceRegistration::new("user-1", "phone", "token-1"))
        .await
        .expect("register");
    assert!(repository.exists(&saved.id).await.expect("exists"));
    assert_eq!(repository.entity_name(), "DeviceRegistration");
    assert_eq!(repository.table().name(), "device_registrations");
}
