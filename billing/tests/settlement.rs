use std::sync::{Arc, Barrier};
use std::thread;

use civicledger_billing::{Invoice, InvoiceStatus, NewInvoice, SettlementEngine};
use civicledger_common::{Currency, LedgerError, MemorySink, ReferenceGenerator, UserId};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn engine() -> SettlementEngine {
    SettlementEngine::new(Arc::new(ReferenceGenerator::new()), Arc::new(MemorySink::new()))
}

fn processed(engine: &SettlementEngine, invoice: NewInvoice) -> Invoice {
    let invoice = engine.register_invoice(invoice).unwrap();
    engine.send(invoice.id).unwrap();
    engine.start_processing(invoice.id).unwrap();
    engine.mark_processed(invoice.id).unwrap()
}

#[test]
fn full_payment_settles_invoice() {
    let engine = engine();
    let invoice = processed(
        &engine,
        NewInvoice::new("business-permit", UserId::new(), dec!(1000), Currency::kes()),
    );
    assert_eq!(invoice.status, InvoiceStatus::Processed);
    assert_eq!(invoice.balance, dec!(1000));

    let outcome = engine.apply_payment(invoice.id, dec!(1000), "R1").unwrap();
    assert_eq!(outcome.new_balance, dec!(0));
    assert_eq!(outcome.new_status, InvoiceStatus::Settled);

    let invoice = engine.invoice(invoice.id).unwrap();
    assert_eq!(invoice.paid, dec!(1000));
    assert_eq!(invoice.balance, dec!(0));
    assert_eq!(invoice.status, InvoiceStatus::Settled);
}

#[test]
fn overpayment_leaves_invoice_untouched() {
    let engine = engine();
    let invoice = processed(
        &engine,
        NewInvoice::new("business-permit", UserId::new(), dec!(1000), Currency::kes()),
    );

    let err = engine.apply_payment(invoice.id, dec!(1500), "R1").unwrap_err();
    assert_eq!(
        err,
        LedgerError::Overpayment {
            amount: dec!(1500),
            balance: dec!(1000),
        }
    );
    assert!(err.is_business_rejection());

    let after = engine.invoice(invoice.id).unwrap();
    assert_eq!(after.paid, dec!(0));
    assert_eq!(after.balance, dec!(1000));
    assert_eq!(after.status, InvoiceStatus::Processed);
    assert!(engine.payments(invoice.id).unwrap().is_empty());
    assert!(engine.receipt_by_reference("R1").is_err());
}

#[test]
fn discount_reduces_the_balance_owed() {
    let engine = engine();
    let invoice = processed(
        &engine,
        NewInvoice::new("land-rates", UserId::new(), dec!(1000), Currency::kes())
            .with_discount(dec!(250))
            .with_tax_rate(dec!(16)),
    );
    assert_eq!(invoice.balance, dec!(750));
    assert_eq!(invoice.total_with_tax, dec!(870));

    assert!(matches!(
        engine.apply_payment(invoice.id, dec!(751), "R1"),
        Err(LedgerError::Overpayment { .. })
    ));
    let outcome = engine.apply_payment(invoice.id, dec!(750), "R1").unwrap();
    assert_eq!(outcome.new_status, InvoiceStatus::Settled);
}

#[test]
fn concurrent_payments_never_overpay() {
    // 20 payments of 100 race for a balance of 1000.
    let engine = Arc::new(engine());
    let invoice = processed(
        &engine,
        NewInvoice::new("business-permit", UserId::new(), dec!(1000), Currency::kes()),
    );
    let barrier = Arc::new(Barrier::new(20));

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.apply_payment(invoice.id, dec!(100), &format!("R{}", i))
            })
        })
        .collect();

    let succeeded = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(Result::is_ok)
        .count();
    assert_eq!(succeeded, 10);

    let invoice = engine.invoice(invoice.id).unwrap();
    assert_eq!(invoice.paid, dec!(1000));
    assert_eq!(invoice.status, InvoiceStatus::Settled);
    assert_eq!(engine.payments(invoice.id).unwrap().len(), 10);
}

#[derive(Debug, Clone)]
enum Step {
    Pay(i64),
    Refund(i64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (1i64..60_000).prop_map(Step::Pay),
        1 => (1i64..60_000).prop_map(Step::Refund),
    ]
}

proptest! {
    #[test]
    fn balance_always_equals_payable_less_discount_and_paid(
        payable in 1_000i64..200_000,
        discount_pct in 0i64..50,
        steps in prop::collection::vec(step(), 1..40),
    ) {
        let engine = engine();
        let payable = Decimal::new(payable, 2);
        let discount = (payable * Decimal::new(discount_pct, 2)).round_dp(2);
        let invoice = processed(
            &engine,
            NewInvoice::new("permit", UserId::new(), payable, Currency::kes()).with_discount(discount),
        );

        for (i, step) in steps.into_iter().enumerate() {
            let _ = match step {
                Step::Pay(cents) => engine
                    .apply_payment(invoice.id, Decimal::new(cents, 2), &format!("R{}", i))
                    .map(|_| ()),
                Step::Refund(cents) => engine.refund(invoice.id, Decimal::new(cents, 2)).map(|_| ()),
            };

            let current = engine.invoice(invoice.id).unwrap();
            prop_assert_eq!(current.balance, current.payable - current.discount - current.paid);
            prop_assert!(current.paid >= Decimal::ZERO);
            prop_assert!(current.balance >= Decimal::ZERO);
            if current.status == InvoiceStatus::Settled {
                prop_assert!(current.balance.is_zero());
            }
        }
    }
}
