mod common;

use common::*;
use proptest::prelude::*;
use strata_config::RepositoryOptions;
use strata_db::{BulkOptions, QueryOptions};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build test runtime")
}

// Widget ids are 1-based positions; `false` entries fail validation
fn widgets_from_flags(flags: &[bool]) -> Vec<Widget> {
    flags
        .iter()
        .enumerate()
        .map(|(idx, valid)| {
            let id = idx as i64 + 1;
            if *valid {
                widget(id, &format!("w{}", id))
            } else {
                invalid_widget(id)
            }
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // With continue_on_error every item lands in exactly one bucket
    #[test]
    fn test_bulk_create_accounts_for_every_item(
        flags in prop::collection::vec(any::<bool>(), 0..24),
        batch_size in 1..8usize,
    ) {
        let input = widgets_from_flags(&flags);
        let (result, stored) = runtime().block_on(async {
            let client = setup_client().await;
            let repository = widget_repository(&client, RepositoryOptions::default());
            let result = repository
                .bulk_create(input.clone(), BulkOptions::new().batch_size(batch_size).continue_on_error(true))
                .await
                .expect("bulk create");
            let stored = repository.count(&QueryOptions::new()).await.expect("count");
            (result, stored)
        });

        prop_assert_eq!(result.success_count + result.failed_count, input.len());
        prop_assert_eq!(result.total_processed, input.len());

        let mut seen: Vec<i64> = result
            .success
            .iter()
            .map(|w| w.id)
            .chain(result.failed.iter().map(|f| f.item.id))
            .collect();
        seen.sort();
        let expected: Vec<i64> = input.iter().map(|w| w.id).collect();
        prop_assert_eq!(seen, expected);

        let valid = flags.iter().filter(|v| **v).count();
        prop_assert_eq!(result.success_count, valid);
        prop_assert_eq!(stored, valid as u64);
    }

    // Without continue_on_error only the batches before the first bad item commit
    #[test]
    fn test_bulk_create_stops_at_the_failing_batch(
        flags in prop::collection::vec(any::<bool>(), 1..24),
        batch_size in 1..8usize,
    ) {
        let input = widgets_from_flags(&flags);
        let (outcome, stored) = runtime().block_on(async {
            let client = setup_client().await;
            let repository = widget_repository(&client, RepositoryOptions::default());
            let outcome = repository
                .bulk_create(input.clone(), BulkOptions::new().batch_size(batch_size))
                .await;
            let stored = repository.count(&QueryOptions::new()).await.expect("count");
            (outcome, stored)
        });

        match flags.iter().position(|valid| !*valid) {
            None => {
                let result = outcome.expect("all items valid");
                prop_assert_eq!(result.success, input);
                prop_assert_eq!(stored, flags.len() as u64);
            }
            Some(first_bad) => {
                prop_assert!(outcome.is_err());
                let committed = (first_bad / batch_size) * batch_size;
                prop_assert_eq!(stored, committed as u64);
            }
        }
    }

    #[test]
    fn test_bulk_delete_accounts_for_every_id(
        stored_ids in prop::collection::btree_set(1..40i64, 0..20),
        requested in prop::collection::vec(1..40i64, 0..20),
        batch_size in 1..8usize,
    ) {
        let mut requested = requested;
        requested.sort();
        requested.dedup();

        let result = runtime().block_on(async {
            let client = setup_client().await;
            let repository = widget_repository(&client, RepositoryOptions::default());
            for id in &stored_ids {
                repository.create(widget(*id, &format!("w{}", id))).await.expect("create");
            }
            repository
                .bulk_delete(requested.clone(), BulkOptions::new().batch_size(batch_size).continue_on_error(true))
                .await
                .expect("bulk delete")
        });

        prop_assert_eq!(result.total_processed, requested.len());
        let hits: Vec<i64> = requested.iter().copied().filter(|id| stored_ids.contains(id)).collect();
        prop_assert_eq!(result.success, hits);
        prop_assert_eq!(result.failed_count, requested.len() - result.success_count);
    }

    #[test]
    fn test_create_then_find_by_id_round_trips(
        id in 1..1_000_000i64,
        name in "[a-z][a-z0-9 ]{0,15}",
        quantity in 0..10_000i64,
        offset_secs in 0..100_000_000i64,
    ) {
        let at = epoch() + chrono::Duration::seconds(offset_secs);
        let entity = Widget {
            id,
            name,
            quantity,
            created_at: at,
            updated_at: at,
        };

        let (created, found) = runtime().block_on(async {
            let client = setup_client().await;
            let repository = widget_repository(&client, RepositoryOptions::default());
            let created = repository.create(entity.clone()).await.expect("create");
            let found = repository.find_by_id(&id).await.expect("find");
            (created, found)
        });

        prop_assert_eq!(&created, &entity);
        prop_assert_eq!(found, Some(entity));
    }
}
