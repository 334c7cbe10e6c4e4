use std::sync::{Arc, Barrier};
use std::thread;

use civicledger_common::{Currency, LedgerError, MemorySink, UserId, WalletId};
use civicledger_wallet::{NewWallet, WalletEngine, WalletLimits};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn funded(amount: Decimal) -> (Arc<WalletEngine>, WalletId) {
    let engine = Arc::new(WalletEngine::new(
        WalletLimits::unlimited(),
        Arc::new(MemorySink::new()),
    ));
    let wallet = engine
        .open_wallet(NewWallet::new(UserId::new(), Currency::kes()).active())
        .unwrap();
    engine.credit(wallet.id, amount, "top-up").unwrap();
    (engine, wallet.id)
}

#[test]
fn concurrent_debits_never_overdraw() {
    // 25 threads race to debit 100 from 1000: exactly 10 may succeed.
    let (engine, id) = funded(dec!(1000));
    let barrier = Arc::new(Barrier::new(25));

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.debit(id, dec!(100), "permit fee")
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 10);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LedgerError::InsufficientFunds { .. })));

    let wallet = engine.wallet(id).unwrap();
    assert_eq!(wallet.available_balance, dec!(0));
    assert_eq!(wallet.total_debit, dec!(1000));
}

#[test]
fn concurrent_holds_and_debits_share_one_balance() {
    let (engine, id) = funded(dec!(600));
    let barrier = Arc::new(Barrier::new(12));

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                if i % 2 == 0 {
                    engine.hold(id, dec!(100), "booking").map(|_| ())
                } else {
                    engine.debit(id, dec!(100), "fee").map(|_| ())
                }
            })
        })
        .collect();

    let succeeded = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(Result::is_ok)
        .count();
    assert_eq!(succeeded, 6);

    let wallet = engine.wallet(id).unwrap();
    assert_eq!(wallet.available_balance, dec!(0));
    assert_eq!(wallet.hold_balance + wallet.total_debit, dec!(600));
}

#[derive(Debug, Clone)]
enum Op {
    Credit(i64),
    Debit(i64),
    Hold(i64),
    Release(i64),
    Capture(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..50_000).prop_map(Op::Credit),
        (1i64..50_000).prop_map(Op::Debit),
        (1i64..50_000).prop_map(Op::Hold),
        (1i64..50_000).prop_map(Op::Release),
        (1i64..50_000).prop_map(Op::Capture),
    ]
}

proptest! {
    #[test]
    fn balances_stay_non_negative_and_conserved(ops in prop::collection::vec(op(), 1..60)) {
        let (engine, id) = funded(dec!(100));

        for op in ops {
            // Rejections are expected; they must leave no trace.
            let before = engine.wallet(id).unwrap();
            let result = match op {
                Op::Credit(c) => engine.credit(id, Decimal::new(c, 2), "in").map(|_| ()),
                Op::Debit(c) => engine.debit(id, Decimal::new(c, 2), "out").map(|_| ()),
                Op::Hold(c) => engine.hold(id, Decimal::new(c, 2), "hold").map(|_| ()),
                Op::Release(c) => engine.release_hold(id, Decimal::new(c, 2), "release").map(|_| ()),
                Op::Capture(c) => engine.capture_hold(id, Decimal::new(c, 2), "capture").map(|_| ()),
            };
            let after = engine.wallet(id).unwrap();
            if result.is_err() {
                prop_assert_eq!(before.available_balance, after.available_balance);
                prop_assert_eq!(before.hold_balance, after.hold_balance);
                prop_assert_eq!(before.total_debit, after.total_debit);
            }

            prop_assert!(after.available_balance >= Decimal::ZERO);
            prop_assert!(after.hold_balance >= Decimal::ZERO);
            prop_assert_eq!(
                after.available_balance + after.hold_balance + after.total_debit,
                after.total_credit
            );
        }
    }
}
