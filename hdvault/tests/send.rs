pub mod harness;

use bitcoin::{Amount, FeeRate};
use harness::{external_address, TestWallet, PASSPHRASE};
use hdvault::bitcoin::{BuildRequest, ConfirmationTarget, FeeChoice, Recipient};
use hdvault::broadcast::Broadcaster;
use hdvault::wallet::{SendRequest, Sent};
use hdvault::Error;
use uuid::Uuid;

fn request(account: u32, sats: u64, fee: FeeChoice, reservation_id: Option<Uuid>) -> SendRequest {
    SendRequest {
        build: BuildRequest {
            account,
            recipients: vec![Recipient::new(&external_address(), Amount::from_sat(sats))],
            min_confirmations: 1,
            fee,
            op_return: None,
        },
        reservation_id,
    }
}

fn absolute(sats: u64) -> FeeChoice {
    FeeChoice::Absolute(Amount::from_sat(sats))
}

#[tokio::test]
async fn send_pays_recipient_and_returns_change() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;

    let sent = wallet
        .wallet
        .send(&request(wallet.account, 40_000, absolute(1_000), None), PASSPHRASE)
        .await
        .unwrap();

    let Sent::Broadcast(built) = sent else {
        panic!("expected the transaction to be broadcast");
    };
    assert_eq!(built.fee, Amount::from_sat(1_000));
    assert_eq!(built.change.as_ref().unwrap().value, Amount::from_sat(59_000));
    assert_eq!(built.inputs.len(), 1);

    let recipient = external_address().script_pubkey();
    assert!(built
        .transaction
        .output
        .iter()
        .any(|output| output.script_pubkey == recipient && output.value == Amount::from_sat(40_000)));
    assert_eq!(wallet.node.submitted(), vec![built.transaction.clone()]);

    // the spent input is held, the change is unconfirmed
    assert_eq!(
        wallet.wallet.balance(wallet.account, 0).await.unwrap(),
        Amount::from_sat(59_000)
    );
    assert_eq!(wallet.wallet.balance(wallet.account, 1).await.unwrap(), Amount::ZERO);
}

#[tokio::test]
async fn confirmed_spend_evicts_the_input() {
    let wallet = TestWallet::new(10).await;
    let funded = wallet.fund(100_000, Some(5)).await;

    let sent = wallet
        .wallet
        .send(&request(wallet.account, 40_000, absolute(1_000), None), PASSPHRASE)
        .await
        .unwrap();
    assert!(wallet.ledger.index().output_id(&funded).is_some());

    wallet
        .ledger
        .apply_transaction(&sent.built().transaction, Some(11))
        .await
        .unwrap();
    wallet.tip.advance(12);

    assert!(wallet.ledger.index().output_id(&funded).is_none());
    assert_eq!(
        wallet.wallet.balance(wallet.account, 1).await.unwrap(),
        Amount::from_sat(59_000)
    );
}

#[tokio::test]
async fn fee_from_policy_covers_the_transaction() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;

    let sent = wallet
        .wallet
        .send(
            &request(wallet.account, 40_000, FeeChoice::Policy(ConfirmationTarget::Medium), None),
            PASSPHRASE,
        )
        .await
        .unwrap();

    let built = sent.built();
    let output_sum: Amount = built.transaction.output.iter().map(|output| output.value).sum();
    assert_eq!(Amount::from_sat(100_000) - output_sum, built.fee);
    assert!(built.fee >= Amount::from_sat(1_000));
    assert!(built.fee >= FeeRate::from_sat_per_vb_unchecked(9).fee_vb(built.transaction.vsize() as u64).unwrap());
}

#[tokio::test]
async fn send_without_funds_is_refused() {
    let wallet = TestWallet::new(10).await;

    let error = wallet
        .wallet
        .send(&request(wallet.account, 40_000, absolute(1_000), None), PASSPHRASE)
        .await
        .unwrap_err();

    assert!(matches!(Error::find(&error), Some(Error::InsufficientFunds(_))));
}

#[tokio::test]
async fn send_above_balance_is_refused() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(10_000, Some(5)).await;

    let error = wallet
        .wallet
        .send(&request(wallet.account, 40_000, absolute(1_000), None), PASSPHRASE)
        .await
        .unwrap_err();

    assert!(matches!(Error::find(&error), Some(Error::InsufficientFunds(_))));
    assert!(wallet.node.submitted().is_empty());
}

#[tokio::test]
async fn fee_below_network_minimum_is_refused() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;

    let error = wallet
        .wallet
        .send(&request(wallet.account, 40_000, absolute(500), None), PASSPHRASE)
        .await
        .unwrap_err();

    assert_eq!(
        Error::find(&error),
        Some(&Error::FeeTooLow {
            minimum: Amount::from_sat(1_000),
            actual: Amount::from_sat(500),
        })
    );
}

#[tokio::test]
async fn wrong_passphrase_is_an_authentication_failure() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;

    let error = wallet
        .wallet
        .send(&request(wallet.account, 40_000, absolute(1_000), None), "wrong")
        .await
        .unwrap_err();

    assert_eq!(Error::find(&error), Some(&Error::AuthenticationFailure));
}

#[tokio::test]
async fn reserved_send_is_not_broadcast() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;
    let reservation_id = Uuid::new_v4();

    let sent = wallet
        .wallet
        .send(
            &request(wallet.account, 40_000, absolute(1_000), Some(reservation_id)),
            PASSPHRASE,
        )
        .await
        .unwrap();

    assert!(matches!(sent, Sent::Reserved { reservation_id: id, .. } if id == reservation_id));
    assert!(wallet.node.submitted().is_empty());
    assert!(wallet.ledger.is_reservation_in_use(reservation_id).await.unwrap());
    assert_eq!(wallet.wallet.balance(wallet.account, 1).await.unwrap(), Amount::ZERO);

    let error = wallet
        .wallet
        .send(
            &request(wallet.account, 1_000, absolute(1_000), Some(reservation_id)),
            PASSPHRASE,
        )
        .await
        .unwrap_err();
    assert_eq!(Error::find(&error), Some(&Error::ReservationConflict(reservation_id)));

    wallet.wallet.broadcast(&sent.built().transaction).await.unwrap();
    assert_eq!(wallet.node.submitted(), vec![sent.built().transaction.clone()]);
}

#[tokio::test]
async fn competing_reservations_of_the_same_output_conflict() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;
    let builder = wallet.builder();
    let build = request(wallet.account, 40_000, absolute(1_000), None).build;

    let first = builder.build(&build, PASSPHRASE).await.unwrap();
    let second = builder.build(&build, PASSPHRASE).await.unwrap();
    assert_eq!(first.inputs, second.inputs);

    let winner = Uuid::new_v4();
    let loser = Uuid::new_v4();
    wallet.ledger.reserve(&first.transaction, winner).await.unwrap();
    let error = wallet.ledger.reserve(&second.transaction, loser).await.unwrap_err();

    assert_eq!(Error::find(&error), Some(&Error::ReservationConflict(loser)));
    assert!(wallet.ledger.is_reservation_in_use(winner).await.unwrap());
    assert!(!wallet.ledger.is_reservation_in_use(loser).await.unwrap());
}

#[tokio::test]
async fn nil_reservation_id_is_refused() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;
    let built = wallet
        .builder()
        .build(&request(wallet.account, 40_000, absolute(1_000), None).build, PASSPHRASE)
        .await
        .unwrap();

    assert!(wallet.ledger.reserve(&built.transaction, Uuid::nil()).await.is_err());
}

#[tokio::test]
async fn rejected_broadcast_leaves_outputs_spendable() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;
    wallet.node.reject_with("min relay fee not met");

    let error = wallet
        .wallet
        .send(&request(wallet.account, 40_000, absolute(1_000), None), PASSPHRASE)
        .await
        .unwrap_err();

    assert_eq!(
        Error::find(&error),
        Some(&Error::BroadcastRejected("min relay fee not met".to_owned()))
    );
    assert_eq!(
        wallet.wallet.balance(wallet.account, 1).await.unwrap(),
        Amount::from_sat(100_000)
    );
}

#[tokio::test]
async fn op_return_payload_is_embedded() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;
    let mut send = request(wallet.account, 40_000, absolute(1_000), None);
    send.build.op_return = Some(b"invoice 42".to_vec());

    let sent = wallet.wallet.send(&send, PASSPHRASE).await.unwrap();

    let data = sent
        .built()
        .transaction
        .output
        .iter()
        .find(|output| output.script_pubkey.is_op_return())
        .unwrap();
    assert_eq!(data.value, Amount::ZERO);
    assert!(data
        .script_pubkey
        .as_bytes()
        .windows(10)
        .any(|window| window == b"invoice 42"));
}

#[tokio::test]
async fn broadcasting_twice_submits_once() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;
    let built = wallet
        .builder()
        .build(&request(wallet.account, 40_000, absolute(1_000), None).build, PASSPHRASE)
        .await
        .unwrap();

    wallet.wallet.broadcast(&built.transaction).await.unwrap();
    wallet.wallet.broadcast(&built.transaction).await.unwrap();

    assert_eq!(wallet.node.submitted().len(), 1);
}

#[tokio::test]
async fn broadcaster_tracks_state() {
    let node = std::sync::Arc::new(harness::FakeNode::new());
    let broadcaster = hdvault::broadcast::NodeBroadcaster::new(node.clone());
    let transaction = harness::funding_transaction(1, external_address().script_pubkey(), 1_000);

    broadcaster.broadcast_transaction(&transaction).await.unwrap();

    let entry = broadcaster
        .get_transaction(transaction.compute_txid())
        .await
        .unwrap();
    assert_eq!(entry.state, hdvault::broadcast::BroadcastState::Propagated);
}

#[tokio::test]
async fn build_after_reservation_without_other_outputs_is_refused() {
    let wallet = TestWallet::new(10).await;
    wallet.fund(100_000, Some(5)).await;
    let reservation_id = Uuid::new_v4();
    wallet
        .wallet
        .send(
            &request(wallet.account, 40_000, absolute(1_000), Some(reservation_id)),
            PASSPHRASE,
        )
        .await
        .unwrap();

    let error = wallet
        .builder()
        .build(&request(wallet.account, 40_000, absolute(1_000), None).build, PASSPHRASE)
        .await
        .unwrap_err();

    assert!(matches!(Error::find(&error), Some(Error::InsufficientFunds(_))));
    assert!(wallet.ledger.is_reservation_in_use(reservation_id).await.unwrap());
}

#[tokio::test]
async fn build_after_reservation_selects_another_output() {
    let wallet = TestWallet::new(10).await;
    let larger = wallet.fund(100_000, Some(5)).await;
    let smaller = wallet.fund(80_000, Some(5)).await;
    let reservation_id = Uuid::new_v4();

    let reserved = wallet
        .wallet
        .send(
            &request(wallet.account, 40_000, absolute(1_000), Some(reservation_id)),
            PASSPHRASE,
        )
        .await
        .unwrap();
    assert_eq!(reserved.built().transaction.input[0].previous_output, larger);

    let second = wallet
        .builder()
        .build(&request(wallet.account, 40_000, absolute(1_000), None).build, PASSPHRASE)
        .await
        .unwrap();

    assert_eq!(second.transaction.input.len(), 1);
    assert_eq!(second.transaction.input[0].previous_output, smaller);
    assert!(wallet.ledger.is_reservation_in_use(reservation_id).await.unwrap());
}
