pub mod harness;

use harness::{spending_transaction, TestWallet};
use hdvault::database::Reservation;
use hdvault::metrics::WalletMetrics;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[tokio::test]
async fn reservation_ages_are_cumulative() {
    let wallet = TestWallet::new(10).await;
    let fresh = wallet.fund(10_000, Some(5)).await;
    let stale = wallet.fund(20_000, Some(5)).await;
    let now = OffsetDateTime::now_utc();

    let index = wallet.ledger.index();
    for (outpoint, age) in [(fresh, Duration::from_secs(30)), (stale, Duration::from_secs(8 * 24 * 3600))] {
        wallet
            .db
            .reserve_outputs(
                &[index.output_id(&outpoint).unwrap()],
                Reservation {
                    id: Uuid::new_v4(),
                    reserved_on: now - age,
                },
            )
            .await
            .unwrap();
    }

    let metrics = WalletMetrics::new().unwrap();
    metrics.refresh(wallet.db.as_ref(), index, now).await.unwrap();
    let text = metrics.render().unwrap();

    assert!(text.contains("hdvault_reserved_outputs{max_age=\"60\"} 1"));
    assert!(text.contains("hdvault_reserved_outputs{max_age=\"245760\"} 1"));
    assert!(text.contains("hdvault_reserved_outputs{max_age=\"+Inf\"} 2"));
}

#[tokio::test]
async fn outputs_count_as_spent_once_a_block_spends_them() {
    let wallet = TestWallet::new(10).await;
    let spent = wallet.fund(10_000, Some(5)).await;
    let reserved = wallet.fund(20_000, Some(5)).await;
    wallet.fund(30_000, Some(5)).await;

    wallet
        .ledger
        .apply_transaction(&spending_transaction(spent), Some(8))
        .await
        .unwrap();
    wallet
        .ledger
        .reserve(&spending_transaction(reserved), Uuid::new_v4())
        .await
        .unwrap();

    let metrics = WalletMetrics::new().unwrap();
    metrics
        .refresh(wallet.db.as_ref(), wallet.ledger.index(), OffsetDateTime::now_utc())
        .await
        .unwrap();
    let text = metrics.render().unwrap();

    assert!(text.contains("hdvault_unspent_outputs 2"));
    assert!(text.contains("hdvault_unspent_sats 50000"));
    assert!(text.contains("hdvault_spent_outputs 1"));
    assert!(text.contains("hdvault_spent_sats 10000"));
    assert!(text.contains("hdvault_newest_spending_block 8"));
}
