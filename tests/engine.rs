mod common;

use std::sync::Arc;

use common::{
    AccountCommand, AccountError, BankAccount, BrokenSnapshotStore, CartCommand, CartError,
    CountingSnapshotStore, FlakyJournal, GatedJournal, ShoppingCart, id,
};
use eventfold_engine::{
    EngineError, EntityConfig, EntityHandle, EntityRegistry, FileJournal, FileSnapshotStore,
    InMemoryJournal, InMemorySnapshotStore, Journal, SnapshotPolicy, SnapshotStore,
    decode_event, fold, spawn_entity,
};
use tokio_stream::StreamExt;

async fn account(registry: &EntityRegistry, name: &str) -> EntityHandle<BankAccount> {
    registry
        .spawn_or_recover(id(name), BankAccount::default(), SnapshotPolicy::default())
        .await
        .expect("account should recover")
}

async fn cart(registry: &EntityRegistry, name: &str) -> EntityHandle<ShoppingCart> {
    registry
        .spawn_or_recover(id(name), ShoppingCart::default(), SnapshotPolicy::default())
        .await
        .expect("cart should recover")
}

fn add_item(item_id: &str, quantity: u32, unit_price: u64) -> CartCommand {
    CartCommand::AddItem {
        item_id: item_id.to_owned(),
        quantity,
        unit_price,
    }
}

#[tokio::test]
async fn deposits_and_withdrawals_respect_balance() {
    let registry = EntityRegistry::in_memory();
    let acct = account(&registry, "acct-1").await;

    assert_eq!(acct.submit(AccountCommand::Deposit(100)).await.unwrap(), 100);
    assert_eq!(acct.submit(AccountCommand::Deposit(50)).await.unwrap(), 150);
    assert_eq!(acct.submit(AccountCommand::Withdraw(30)).await.unwrap(), 120);
    assert_eq!(acct.submit(AccountCommand::GetBalance).await.unwrap(), 120);

    let err = acct
        .submit(AccountCommand::Withdraw(200))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ValidationRejected(AccountError::InsufficientFunds)
    ));
    assert_eq!(err.to_string(), "Insufficient funds");
    assert_eq!(acct.submit(AccountCommand::GetBalance).await.unwrap(), 120);
    assert_eq!(acct.last_sequence().await.unwrap(), 3);

    // Withdrawing the exact balance is allowed.
    assert_eq!(acct.submit(AccountCommand::Withdraw(120)).await.unwrap(), 0);
    assert_eq!(acct.last_sequence().await.unwrap(), 4);
}

#[tokio::test]
async fn closed_account_rejects_deposits() {
    let registry = EntityRegistry::in_memory();
    let acct = account(&registry, "acct-1").await;

    acct.submit(AccountCommand::Deposit(10)).await.unwrap();
    acct.submit(AccountCommand::Close).await.unwrap();

    let err = acct.submit(AccountCommand::Deposit(5)).await.unwrap_err();
    assert_eq!(err.to_string(), "Account is closed");
    assert!(err.is_rejection());
}

#[tokio::test]
async fn cart_merges_quantities_of_same_item() {
    let registry = EntityRegistry::in_memory();
    let c = cart(&registry, "cart-1").await;

    c.submit(add_item("A", 1, 10)).await.unwrap();
    let view = c.submit(add_item("A", 2, 10)).await.unwrap();

    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items["A"].quantity, 3);
    assert_eq!(view.total(), 30);
}

#[tokio::test]
async fn checked_out_cart_rejects_new_items() {
    let registry = EntityRegistry::in_memory();
    let c = cart(&registry, "cart-1").await;

    c.submit(add_item("A", 1, 10)).await.unwrap();
    c.submit(CartCommand::Checkout).await.unwrap();

    let err = c.submit(add_item("B", 1, 5)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ValidationRejected(CartError::AlreadyCheckedOut)
    ));
    assert_eq!(err.to_string(), "Cart is already checked out");
    assert_eq!(c.submit(CartCommand::View).await.unwrap().total(), 10);
}

#[tokio::test]
async fn twenty_events_trigger_one_snapshot_at_twenty() {
    let snapshots = CountingSnapshotStore::default();
    let registry = EntityRegistry::builder()
        .snapshot_store(snapshots.clone())
        .build();
    let acct = registry
        .spawn_or_recover(id("acct-1"), BankAccount::default(), SnapshotPolicy::every(20))
        .await
        .unwrap();

    for _ in 0..20 {
        acct.submit(AccountCommand::Deposit(1)).await.unwrap();
    }
    registry.stop_all().await;

    assert_eq!(snapshots.saved_sequences(), vec![20]);
}

#[tokio::test]
async fn failed_append_leaves_state_at_previous_command() {
    let journal = FlakyJournal::failing_on(5);
    let registry = EntityRegistry::builder().journal(journal.clone()).build();
    let acct = account(&registry, "acct-1").await;

    for _ in 0..4 {
        acct.submit(AccountCommand::Deposit(10)).await.unwrap();
    }
    let err = acct
        .submit(AccountCommand::Deposit(10))
        .await
        .unwrap_err();
    assert!(
        matches!(err, EngineError::PersistenceFailure(_)),
        "expected PersistenceFailure, got: {err:?}"
    );

    assert_eq!(acct.state().await.unwrap().balance, 40);
    assert_eq!(acct.last_sequence().await.unwrap(), 4);
    assert_eq!(journal.inner().records(&id("acct-1")).await.len(), 4);

    // The process stays usable after a persistence failure.
    assert_eq!(acct.submit(AccountCommand::Deposit(10)).await.unwrap(), 50);
    assert_eq!(acct.last_sequence().await.unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_persist_in_delivery_order() {
    let journal = InMemoryJournal::new();
    let registry = EntityRegistry::builder()
        .journal(journal.clone())
        .config(EntityConfig::default().mailbox_capacity(256))
        .build();
    let acct = account(&registry, "acct-1").await;

    let mut tasks = Vec::new();
    for amount in 1..=100u64 {
        let acct = acct.clone();
        tasks.push(tokio::spawn(async move {
            let balance = acct.submit(AccountCommand::Deposit(amount)).await.unwrap();
            (amount, balance)
        }));
    }
    let mut replies = std::collections::HashMap::new();
    for task in tasks {
        let (amount, balance) = task.await.unwrap();
        replies.insert(amount, balance);
    }

    let records = journal.records(&id("acct-1")).await;
    assert_eq!(records.len(), 100);

    // Each reply equals the running balance at that command's journal
    // position, so no two commands interleaved.
    let mut running = 0;
    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, index as u64 + 1);
        let amount = match decode_event::<BankAccount>(record).unwrap() {
            common::AccountEvent::Deposited { amount } => amount,
            other => panic!("unexpected event {other:?}"),
        };
        running += amount;
        assert_eq!(replies[&amount], running);
    }
    assert_eq!(acct.state().await.unwrap().balance, 5050);
}

#[tokio::test]
async fn recovery_from_files_equals_direct_fold() {
    let tmp = tempfile::tempdir().unwrap();
    let policy = SnapshotPolicy::every(3).keep(2);

    {
        let registry = EntityRegistry::builder().base_dir(tmp.path()).build();
        let acct = registry
            .spawn_or_recover(id("acct-1"), BankAccount::default(), policy)
            .await
            .unwrap();
        for amount in [100, 20, 5, 7, 13] {
            acct.submit(AccountCommand::Deposit(amount)).await.unwrap();
        }
        acct.submit(AccountCommand::Withdraw(45)).await.unwrap();
        acct.submit(AccountCommand::Deposit(1)).await.unwrap();
        registry.stop_all().await;
    }

    let journal = FileJournal::new(tmp.path());
    let mut stream = journal.read_from(&id("acct-1"), 0).await.unwrap();
    let mut events = Vec::new();
    while let Some(record) = stream.next().await {
        events.push(decode_event::<BankAccount>(&record.unwrap()).unwrap());
    }
    assert_eq!(events.len(), 7);
    let expected = fold(BankAccount::default(), &events);

    // The snapshot at 6 plus one trailing event must match a full fold.
    let snapshots = FileSnapshotStore::new(tmp.path());
    assert_eq!(snapshots.list(&id("acct-1")).await.unwrap(), vec![3, 6]);

    for _ in 0..2 {
        let registry = EntityRegistry::builder().base_dir(tmp.path()).build();
        let acct = registry
            .spawn_or_recover(id("acct-1"), BankAccount::default(), policy)
            .await
            .unwrap();
        assert_eq!(acct.state().await.unwrap(), expected);
        assert_eq!(acct.last_sequence().await.unwrap(), 7);
        registry.stop_all().await;
    }
    assert_eq!(expected.balance, 101);
}

#[tokio::test]
async fn retention_never_exceeds_keep_count() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = EntityRegistry::builder()
        .base_dir(tmp.path())
        .config(EntityConfig::default().snapshot_queue_capacity(64))
        .build();
    let acct = registry
        .spawn_or_recover(
            id("acct-1"),
            BankAccount::default(),
            SnapshotPolicy::every(5).keep(2),
        )
        .await
        .unwrap();

    for _ in 0..40 {
        acct.submit(AccountCommand::Deposit(1)).await.unwrap();
    }
    registry.stop_all().await;

    let snapshots = FileSnapshotStore::new(tmp.path());
    assert_eq!(snapshots.list(&id("acct-1")).await.unwrap(), vec![35, 40]);
}

#[tokio::test]
async fn snapshot_failures_do_not_fail_commands() {
    let registry = EntityRegistry::builder()
        .snapshot_store(BrokenSnapshotStore::default())
        .build();
    let acct = registry
        .spawn_or_recover(id("acct-1"), BankAccount::default(), SnapshotPolicy::every(1))
        .await
        .unwrap();

    for _ in 0..5 {
        acct.submit(AccountCommand::Deposit(2)).await.unwrap();
    }
    assert_eq!(acct.state().await.unwrap().balance, 10);
}

#[tokio::test]
async fn second_writer_is_stopped_by_conflict() {
    let journal: Arc<dyn Journal> = Arc::new(InMemoryJournal::new());
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let spawn = || {
        spawn_entity(
            id("acct-1"),
            BankAccount::default(),
            Arc::clone(&journal),
            Arc::clone(&snapshots),
            EntityConfig::default(),
        )
    };

    let first = spawn().await.unwrap();
    let second = spawn().await.unwrap();

    first.submit(AccountCommand::Deposit(10)).await.unwrap();
    let err = second
        .submit(AccountCommand::Deposit(99))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            EngineError::Conflict {
                expected: 0,
                actual: 1
            }
        ),
        "expected Conflict, got: {err:?}"
    );

    second.stop().await;
    assert!(matches!(
        second.submit(AccountCommand::Deposit(1)).await,
        Err(EngineError::Stopped)
    ));

    // Re-recovering picks up the winner's history.
    let third = spawn().await.unwrap();
    assert_eq!(third.state().await.unwrap().balance, 10);
}

#[tokio::test]
async fn full_mailbox_reports_overload() {
    let journal = GatedJournal::new();
    let registry = EntityRegistry::builder()
        .journal(journal.clone())
        .config(EntityConfig::default().mailbox_capacity(1))
        .build();
    let acct = account(&registry, "acct-1").await;

    // First command is in flight, blocked on the journal.
    let in_flight = tokio::spawn({
        let acct = acct.clone();
        async move { acct.submit(AccountCommand::Deposit(10)).await }
    });
    journal.wait_for_append().await;

    // Second command occupies the only mailbox slot.
    let queued = tokio::spawn({
        let acct = acct.clone();
        async move { acct.submit(AccountCommand::Deposit(20)).await }
    });
    tokio::task::yield_now().await;

    let err = acct
        .submit(AccountCommand::Deposit(30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Overloaded), "got: {err:?}");

    journal.open();
    assert_eq!(in_flight.await.unwrap().unwrap(), 10);
    assert_eq!(queued.await.unwrap().unwrap(), 30);
}

#[tokio::test]
async fn stop_finishes_in_flight_and_rejects_queued() {
    let journal = GatedJournal::new();
    let registry = EntityRegistry::builder().journal(journal.clone()).build();
    let acct = account(&registry, "acct-1").await;

    let in_flight = tokio::spawn({
        let acct = acct.clone();
        async move { acct.submit(AccountCommand::Deposit(10)).await }
    });
    journal.wait_for_append().await;

    let queued = tokio::spawn({
        let acct = acct.clone();
        async move { acct.submit(AccountCommand::Deposit(20)).await }
    });
    tokio::task::yield_now().await;

    let stopping = tokio::spawn({
        let acct = acct.clone();
        async move { acct.stop().await }
    });
    tokio::task::yield_now().await;
    assert!(!acct.is_alive());

    journal.open();
    stopping.await.unwrap();

    assert_eq!(in_flight.await.unwrap().unwrap(), 10);
    assert!(matches!(queued.await.unwrap(), Err(EngineError::Stopped)));
    assert!(matches!(
        acct.submit(AccountCommand::Deposit(1)).await,
        Err(EngineError::Stopped)
    ));

    // The in-flight deposit was persisted.
    let acct = account(&registry, "acct-1").await;
    assert_eq!(acct.state().await.unwrap().balance, 10);
}

#[tokio::test]
async fn respawn_waits_for_stopping_process_to_finish() {
    let journal = GatedJournal::new();
    let registry = EntityRegistry::builder().journal(journal.clone()).build();
    let acct = account(&registry, "acct-1").await;

    let in_flight = tokio::spawn({
        let acct = acct.clone();
        async move { acct.submit(AccountCommand::Deposit(10)).await }
    });
    journal.wait_for_append().await;

    let stopping = tokio::spawn({
        let acct = acct.clone();
        async move { acct.stop().await }
    });
    tokio::task::yield_now().await;

    // The old process still owes its append; recovery must not start yet.
    let respawned = tokio::spawn({
        let registry = registry.clone();
        async move { account(&registry, "acct-1").await }
    });
    tokio::task::yield_now().await;
    assert!(!respawned.is_finished());

    journal.open();
    assert_eq!(in_flight.await.unwrap().unwrap(), 10);
    stopping.await.unwrap();

    let acct = respawned.await.unwrap();
    assert_eq!(acct.submit(AccountCommand::Deposit(5)).await.unwrap(), 15);
    assert_eq!(acct.last_sequence().await.unwrap(), 2);
}

#[tokio::test]
async fn registry_stop_keeps_entry_until_process_exits() {
    let journal = GatedJournal::new();
    let registry = EntityRegistry::builder().journal(journal.clone()).build();
    let acct = account(&registry, "acct-1").await;

    let in_flight = tokio::spawn({
        let acct = acct.clone();
        async move { acct.submit(AccountCommand::Deposit(10)).await }
    });
    journal.wait_for_append().await;

    let stopping = tokio::spawn({
        let registry = registry.clone();
        async move { registry.stop(&id("acct-1")).await }
    });
    tokio::task::yield_now().await;
    assert!(registry.get::<BankAccount>(&id("acct-1")).await.is_none());

    let respawned = tokio::spawn({
        let registry = registry.clone();
        async move { account(&registry, "acct-1").await }
    });
    tokio::task::yield_now().await;
    assert!(!respawned.is_finished());

    journal.open();
    assert_eq!(in_flight.await.unwrap().unwrap(), 10);
    assert!(stopping.await.unwrap());

    let acct = respawned.await.unwrap();
    assert_eq!(acct.submit(AccountCommand::Deposit(5)).await.unwrap(), 15);
    // The finished stop must not evict the replacement.
    assert_eq!(registry.ids().await, vec![id("acct-1")]);
}

#[tokio::test]
async fn entities_are_isolated_from_each_other() {
    let registry = EntityRegistry::in_memory();
    let a = account(&registry, "acct-a").await;
    let b = account(&registry, "acct-b").await;

    a.submit(AccountCommand::Deposit(5)).await.unwrap();
    b.submit(AccountCommand::Deposit(7)).await.unwrap();
    b.submit(AccountCommand::Close).await.unwrap();

    assert_eq!(a.submit(AccountCommand::Deposit(1)).await.unwrap(), 6);
    assert_eq!(a.last_sequence().await.unwrap(), 2);
    assert_eq!(b.last_sequence().await.unwrap(), 2);
    assert_eq!(registry.ids().await, vec![id("acct-a"), id("acct-b")]);
}
