use pgtestpool::tables::Templates;
use pgtestpool::{BoxError, DatabaseHook, Error, Pool};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_builds_run_setup_once() -> anyhow::Result<()> {
    const RACERS: usize = 6;

    let name = common::unique_name("tmpl_once");
    let runs = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..RACERS {
        let config = common::test_config(&name, RACERS as u32).await;
        let runs = runs.clone();
        tasks.push(tokio::spawn(async move {
            let setup_runs = runs.clone();
            let pool = Pool::builder(config)
                .setup_template(move |db: sqlx::PgPool| {
                    let runs = setup_runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        // Widen the race window.
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        common::SeedItems.run(&db).await
                    }
                })
                .build()
                .await?;
            let db = pool.acquire().await?;
            let items = common::item_names(db.pool()).await;
            db.release().await?;
            pool.close().await;
            Ok::<Vec<String>, Error>(items)
        }));
    }

    for task in tasks {
        let items = task.await??;
        assert_eq!(items, vec![common::constants::SEED_ITEM.to_string()]);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let root = common::root_pool().await;
    let template = Templates::new(root.clone())
        .get(&name)
        .await?
        .expect("template record missing");
    assert!(template.setup_complete);
    assert!(template.completed_at.is_some());

    pgtestpool::cleanup_pool(&root, &name).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_pool_first_acquires_outnumber_admin_connections() -> anyhow::Result<()> {
    const ACQUIRERS: usize = 6;

    let name = common::unique_name("tmpl_shared");
    let runs = Arc::new(AtomicUsize::new(0));

    let config = common::test_config(&name, 8)
        .await
        .with_root_max_connections(2);
    let setup_runs = runs.clone();
    let pool = Pool::builder(config)
        .setup_template(move |db: sqlx::PgPool| {
            let runs = setup_runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                common::SeedItems.run(&db).await
            }
        })
        .build()
        .await?;

    let mut tasks = Vec::new();
    for _ in 0..ACQUIRERS {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.acquire_timeout(Duration::from_secs(30)).await
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await??);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let indexes: HashSet<i32> = handles.iter().map(|db| db.slot_index()).collect();
    assert_eq!(indexes.len(), ACQUIRERS);

    for db in handles {
        assert_eq!(
            common::item_names(db.pool()).await,
            vec![common::constants::SEED_ITEM.to_string()]
        );
        db.release().await?;
    }

    pool.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_setup_is_retried_by_next_caller() -> anyhow::Result<()> {
    let name = common::unique_name("tmpl_retry");
    let attempts = Arc::new(AtomicUsize::new(0));

    let setup_attempts = attempts.clone();
    let pool = common::isolate_pool(&name, 1)
        .await
        .setup_template(move |db: sqlx::PgPool| {
            let attempts = setup_attempts.clone();
            async move {
                // Leaves the template half-initialized on the first attempt.
                sqlx::query("CREATE TABLE items (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL)")
                    .execute(&db)
                    .await?;
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err::<(), BoxError>("first setup attempt fails".into());
                }
                sqlx::query("INSERT INTO items (name) VALUES ($1)")
                    .bind(common::constants::SEED_ITEM)
                    .execute(&db)
                    .await?;
                Ok(())
            }
        })
        .build()
        .await?;

    let err = pool.acquire().await.unwrap_err();
    assert!(
        matches!(err, Error::TemplateSetupFailed { .. }),
        "unexpected error: {:?}",
        err
    );
    let templates = Templates::new(pool.root().clone());
    assert!(!templates.is_setup_complete(&name).await?);
    // No slot was claimed for the failed attempt.
    assert_eq!(pool.stats().await?.total_slots, 0);

    let db = pool.acquire().await?;
    assert_eq!(
        common::item_names(db.pool()).await,
        vec![common::constants::SEED_ITEM.to_string()]
    );
    db.release().await?;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(templates.is_setup_complete(&name).await?);

    pool.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn test_second_pool_skips_completed_setup() -> anyhow::Result<()> {
    let name = common::unique_name("tmpl_skip");
    let first = common::isolate_pool(&name, 2).await.build().await?;
    let db = first.acquire().await?;
    db.release().await?;

    let second = common::isolate_pool(&name, 2)
        .await
        .setup_template(|_db: sqlx::PgPool| async move {
            Err::<(), BoxError>("setup must not run again".into())
        })
        .build()
        .await?;
    let db = second.acquire().await?;
    assert_eq!(
        common::item_names(db.pool()).await,
        vec![common::constants::SEED_ITEM.to_string()]
    );
    db.release().await?;

    second.close().await;
    first.cleanup().await?;
    Ok(())
}
