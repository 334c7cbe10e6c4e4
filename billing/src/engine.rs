//! Settlement engine: applies payments against invoices and advances their
//! status.
//!
//! Lock order is invoice row, then receipt row. The paid, balance and
//! status fields of invoices and receipts are only written here.

use std::sync::Arc;

use civicledger_common::{
    now, Entity, EventSink, InvoiceId, LedgerError, LedgerEvent, ReceiptId, ReferenceGenerator,
    ReferenceKind, Result, Timestamp, UserId,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::invoice::{AppliedPayment, Invoice, InvoiceStatus, NewInvoice, PaymentOutcome};
use crate::receipt::{NewReceipt, Receipt, ReceiptStatus};

struct InvoiceRow {
    invoice: Invoice,
    payments: Vec<AppliedPayment>,
}

/// Applies payments to invoices and receipts.
pub struct SettlementEngine {
    invoices: DashMap<InvoiceId, Arc<Mutex<InvoiceRow>>>,
    invoice_refs: DashMap<String, InvoiceId>,
    receipts: DashMap<ReceiptId, Arc<Mutex<Receipt>>>,
    receipt_refs: DashMap<String, ReceiptId>,
    references: Arc<ReferenceGenerator>,
    events: Arc<dyn EventSink>,
}

impl SettlementEngine {
    pub fn new(references: Arc<ReferenceGenerator>, events: Arc<dyn EventSink>) -> Self {
        Self {
            invoices: DashMap::new(),
            invoice_refs: DashMap::new(),
            receipts: DashMap::new(),
            receipt_refs: DashMap::new(),
            references,
            events,
        }
    }

    /// Register an invoice in `Pending` status.
    #[instrument(skip(self, new), fields(user_id = %new.user_id, payable = %new.payable))]
    pub fn register_invoice(&self, new: NewInvoice) -> Result<Invoice> {
        validate_invoice(&new)?;

        let at = now();
        let reference = self.references.next(ReferenceKind::Invoice, at);
        let invoice = Invoice::issue(new, reference, at);

        self.invoice_refs.insert(invoice.reference.clone(), invoice.id);
        self.invoices.insert(
            invoice.id,
            Arc::new(Mutex::new(InvoiceRow {
                invoice: invoice.clone(),
                payments: Vec::new(),
            })),
        );

        info!(
            invoice_id = %invoice.id,
            reference = %invoice.reference,
            balance = %invoice.balance,
            "Invoice registered"
        );
        Ok(invoice)
    }

    /// Register a receipt in `Pending` status, optionally against an invoice.
    #[instrument(skip(self, new), fields(payer = %new.payer, payable = %new.payable))]
    pub fn register_receipt(&self, new: NewReceipt) -> Result<Receipt> {
        if new.payable <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(new.payable));
        }
        if new.discount < Decimal::ZERO || new.discount >= new.payable {
            return Err(LedgerError::validation(
                format!("discount {} must be within [0, {})", new.discount, new.payable),
                "discount",
            ));
        }
        if let Some(invoice_id) = new.invoice_id {
            let invoice = self.invoice(invoice_id)?;
            if invoice.currency != new.currency {
                return Err(LedgerError::validation(
                    format!(
                        "receipt currency {} differs from invoice currency {}",
                        new.currency, invoice.currency
                    ),
                    "currency",
                ));
            }
        }

        let at = now();
        let reference = match &new.reference {
            Some(reference) if reference.trim().is_empty() => {
                return Err(LedgerError::validation("receipt reference is empty", "reference"));
            }
            Some(reference) => reference.trim().to_string(),
            None => self.references.next(ReferenceKind::Receipt, at),
        };

        let receipt = Receipt::register(new, reference, at);
        match self.receipt_refs.entry(receipt.reference.clone()) {
            Entry::Occupied(_) => {
                return Err(LedgerError::Duplicate {
                    entity: Entity::Receipt,
                    key: receipt.reference,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(receipt.id);
            }
        }
        self.receipts
            .insert(receipt.id, Arc::new(Mutex::new(receipt.clone())));

        self.events.publish(LedgerEvent::ReceiptIssued {
            receipt_id: receipt.id,
            reference: receipt.reference.clone(),
            invoice_id: receipt.invoice_id,
            amount: receipt.balance,
        });
        info!(receipt_id = %receipt.id, reference = %receipt.reference, "Receipt registered");
        Ok(receipt)
    }

    fn row(&self, id: InvoiceId) -> Result<Arc<Mutex<InvoiceRow>>> {
        self.invoices
            .get(&id)
            .map(|row| Arc::clone(&row))
            .ok_or_else(|| LedgerError::not_found(Entity::Invoice, id))
    }

    fn receipt_row(&self, id: ReceiptId) -> Result<Arc<Mutex<Receipt>>> {
        self.receipts
            .get(&id)
            .map(|row| Arc::clone(&row))
            .ok_or_else(|| LedgerError::not_found(Entity::Receipt, id))
    }

    pub fn invoice(&self, id: InvoiceId) -> Result<Invoice> {
        Ok(self.row(id)?.lock().invoice.clone())
    }

    pub fn invoice_by_reference(&self, reference: &str) -> Result<Invoice> {
        let id = self
            .invoice_refs
            .get(reference)
            .map(|id| *id)
            .ok_or_else(|| LedgerError::not_found(Entity::Invoice, reference))?;
        self.invoice(id)
    }

    pub fn invoices_for_user(&self, user_id: UserId) -> Vec<Invoice> {
        let rows: Vec<_> = self.invoices.iter().map(|row| Arc::clone(row.value())).collect();
        rows.iter()
            .map(|row| row.lock().invoice.clone())
            .filter(|invoice| invoice.user_id == user_id)
            .collect()
    }

    /// Payments applied to an invoice, oldest first.
    pub fn payments(&self, id: InvoiceId) -> Result<Vec<AppliedPayment>> {
        Ok(self.row(id)?.lock().payments.clone())
    }

    pub fn receipt(&self, id: ReceiptId) -> Result<Receipt> {
        Ok(self.receipt_row(id)?.lock().clone())
    }

    pub fn receipt_by_reference(&self, reference: &str) -> Result<Receipt> {
        let id = self
            .receipt_refs
            .get(reference)
            .map(|id| *id)
            .ok_or_else(|| LedgerError::not_found(Entity::Receipt, reference))?;
        self.receipt(id)
    }

    pub fn receipts_for_invoice(&self, invoice_id: InvoiceId) -> Vec<Receipt> {
        let rows: Vec<_> = self.receipts.iter().map(|row| Arc::clone(row.value())).collect();
        rows.iter()
            .map(|row| row.lock().clone())
            .filter(|receipt| receipt.invoice_id == Some(invoice_id))
            .collect()
    }

    // Workflow

    pub fn send(&self, id: InvoiceId) -> Result<Invoice> {
        self.advance(id, InvoiceStatus::Sent)
    }

    pub fn mark_viewed(&self, id: InvoiceId) -> Result<Invoice> {
        self.advance(id, InvoiceStatus::Viewed)
    }

    pub fn start_processing(&self, id: InvoiceId) -> Result<Invoice> {
        self.advance(id, InvoiceStatus::Processing)
    }

    pub fn mark_processed(&self, id: InvoiceId) -> Result<Invoice> {
        self.advance(id, InvoiceStatus::Processed)
    }

    pub fn dispute(&self, id: InvoiceId) -> Result<Invoice> {
        self.advance(id, InvoiceStatus::Disputed)
    }

    fn advance(&self, id: InvoiceId, next: InvoiceStatus) -> Result<Invoice> {
        let row = self.row(id)?;
        let mut row = row.lock();
        let invoice = &mut row.invoice;

        if !invoice.status.can_transition_to(next) {
            return Err(LedgerError::transition(Entity::Invoice, invoice.status, next));
        }
        invoice.status = next;
        invoice.updated_at = now();

        info!(invoice_id = %id, status = ?next, "Invoice advanced");
        Ok(invoice.clone())
    }

    /// Record who approved the invoice.
    pub fn approve(&self, id: InvoiceId, approver: UserId) -> Result<Invoice> {
        let row = self.row(id)?;
        let mut row = row.lock();
        let invoice = &mut row.invoice;

        if invoice.status.is_final() {
            return Err(refused(invoice.status, "Approved"));
        }
        let at = now();
        invoice.approved_by = Some(approver);
        invoice.approved_at = Some(at);
        invoice.updated_at = at;

        info!(invoice_id = %id, approver = %approver, "Invoice approved");
        Ok(invoice.clone())
    }

    // Settlement

    /// Apply a payment of `amount` under `receipt_ref`.
    ///
    /// A registered receipt with that reference is updated; otherwise a
    /// paid receipt is generated. Over-payment is rejected, never clamped.
    #[instrument(skip(self))]
    pub fn apply_payment(
        &self,
        id: InvoiceId,
        amount: Decimal,
        receipt_ref: &str,
    ) -> Result<PaymentOutcome> {
        let receipt_ref = receipt_ref.trim();
        let row = self.row(id)?;
        let mut row = row.lock();

        if let Err(e) = check_invoice_payment(&row, amount, receipt_ref) {
            warn!(invoice_id = %id, amount = %amount, error = %e, "Payment refused");
            return Err(e);
        }

        let at = now();
        let registered = self.receipt_refs.get(receipt_ref).map(|id| *id);
        let receipt_id = match registered {
            Some(receipt_id) => {
                let receipt = self.receipt_row(receipt_id)?;
                let mut receipt = receipt.lock();
                if let Err(e) = check_receipt_payment(&receipt, &row.invoice, amount) {
                    warn!(invoice_id = %id, receipt_ref = %receipt_ref, error = %e, "Payment refused");
                    return Err(e);
                }
                receipt.record_payment(amount, at);
                receipt.invoice_id = Some(id);
                receipt_id
            }
            None => {
                let receipt = Receipt::for_payment(
                    receipt_ref.to_string(),
                    id,
                    &row.invoice.category,
                    row.invoice.user_id.to_string(),
                    amount,
                    row.invoice.currency.clone(),
                    at,
                );
                // A payment on another invoice may have claimed the reference
                // since the lookup above.
                match self.receipt_refs.entry(receipt_ref.to_string()) {
                    Entry::Occupied(_) => {
                        return Err(LedgerError::DuplicatePayment {
                            receipt_ref: receipt_ref.to_string(),
                        });
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(receipt.id);
                    }
                }
                let receipt_id = receipt.id;
                self.receipts.insert(receipt_id, Arc::new(Mutex::new(receipt)));
                self.events.publish(LedgerEvent::ReceiptIssued {
                    receipt_id,
                    reference: receipt_ref.to_string(),
                    invoice_id: Some(id),
                    amount,
                });
                receipt_id
            }
        };

        let invoice = &mut row.invoice;
        let prior_status = invoice.status;
        invoice.paid += amount;
        invoice.recompute_balance();
        invoice.status = invoice.payment_status(at);
        invoice.updated_at = at;
        let outcome = PaymentOutcome {
            invoice_id: id,
            receipt_id,
            new_balance: invoice.balance,
            new_status: invoice.status,
        };
        let user_id = invoice.user_id;
        row.payments.push(AppliedPayment {
            receipt_ref: receipt_ref.to_string(),
            receipt_id,
            amount,
            applied_at: at,
            prior_status,
        });
        drop(row);

        self.events.publish(LedgerEvent::InvoicePaymentApplied {
            invoice_id: id,
            receipt_ref: receipt_ref.to_string(),
            amount,
            balance: outcome.new_balance,
        });
        if outcome.new_status == InvoiceStatus::Settled {
            self.events.publish(LedgerEvent::InvoiceSettled {
                invoice_id: id,
                user_id,
            });
        }
        info!(
            invoice_id = %id,
            amount = %amount,
            balance = %outcome.new_balance,
            status = ?outcome.new_status,
            "Payment applied"
        );
        Ok(outcome)
    }

    /// Flag the invoice overdue when it is past due with money outstanding.
    /// A no-op otherwise.
    pub fn mark_overdue(&self, id: InvoiceId, at: Timestamp) -> Result<Invoice> {
        let row = self.row(id)?;
        let mut row = row.lock();
        self.flag_overdue(&mut row.invoice, at);
        Ok(row.invoice.clone())
    }

    fn flag_overdue(&self, invoice: &mut Invoice, at: Timestamp) -> bool {
        let eligible = invoice.status.accepts_payment()
            && !matches!(invoice.status, InvoiceStatus::Overdue | InvoiceStatus::Disputed)
            && invoice.is_past_due(at);
        if !eligible {
            return false;
        }
        invoice.status = InvoiceStatus::Overdue;
        invoice.updated_at = at;

        self.events.publish(LedgerEvent::InvoiceOverdue {
            invoice_id: invoice.id,
            user_id: invoice.user_id,
            balance: invoice.balance,
        });
        info!(invoice_id = %invoice.id, balance = %invoice.balance, "Invoice overdue");
        true
    }

    /// Mark every eligible invoice overdue. Returns how many changed.
    pub fn sweep_overdue(&self, at: Timestamp) -> usize {
        let rows: Vec<_> = self.invoices.iter().map(|row| Arc::clone(row.value())).collect();
        rows.iter()
            .filter(|row| self.flag_overdue(&mut row.lock().invoice, at))
            .count()
    }

    /// Cancel an invoice that is not yet fully paid.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: InvoiceId, reason: &str) -> Result<Invoice> {
        if reason.trim().is_empty() {
            return Err(LedgerError::validation("cancellation reason is required", "reason"));
        }
        let row = self.row(id)?;
        let mut row = row.lock();
        let invoice = &mut row.invoice;

        if invoice.is_settled() || !invoice.status.can_transition_to(InvoiceStatus::Cancelled) {
            return Err(LedgerError::transition(
                Entity::Invoice,
                invoice.status,
                InvoiceStatus::Cancelled,
            ));
        }
        invoice.status = InvoiceStatus::Cancelled;
        invoice.cancellation_reason = Some(reason.to_string());
        invoice.updated_at = now();
        let invoice = invoice.clone();
        drop(row);

        self.events.publish(LedgerEvent::InvoiceCancelled {
            invoice_id: id,
            reason: reason.to_string(),
        });
        info!(invoice_id = %id, reason = %reason, "Invoice cancelled");
        Ok(invoice)
    }

    /// Return `amount` of what was paid. Allowed from `Settled` or `Partial`.
    #[instrument(skip(self))]
    pub fn refund(&self, id: InvoiceId, amount: Decimal) -> Result<Invoice> {
        let row = self.row(id)?;
        let mut row = row.lock();
        let status = row.invoice.status;

        if !matches!(
            status,
            InvoiceStatus::Settled | InvoiceStatus::Partial | InvoiceStatus::Overdue
        ) {
            return Err(LedgerError::transition(Entity::Invoice, status, InvoiceStatus::Refunded));
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if amount > row.invoice.paid {
            return Err(LedgerError::InvalidRefund {
                amount,
                paid: row.invoice.paid,
            });
        }

        let at = now();
        let invoice = &mut row.invoice;
        invoice.paid -= amount;
        invoice.recompute_balance();
        invoice.status = if invoice.paid.is_zero() {
            InvoiceStatus::Refunded
        } else {
            invoice.payment_status(at)
        };
        invoice.updated_at = at;
        let invoice = invoice.clone();

        // Unwind receipts newest first.
        let mut remaining = amount;
        let mut seen = Vec::new();
        for payment in row.payments.iter().rev() {
            if remaining.is_zero() {
                break;
            }
            if seen.contains(&payment.receipt_id) {
                continue;
            }
            seen.push(payment.receipt_id);
            if let Some(receipt) = self.receipts.get(&payment.receipt_id).map(|r| Arc::clone(&r)) {
                let mut receipt = receipt.lock();
                let share = remaining.min(receipt.paid);
                receipt.record_refund(share, at);
                remaining -= share;
            }
        }
        drop(row);

        self.events.publish(LedgerEvent::InvoiceRefunded {
            invoice_id: id,
            amount,
            paid: invoice.paid,
        });
        info!(invoice_id = %id, amount = %amount, paid = %invoice.paid, status = ?invoice.status, "Invoice refunded");
        Ok(invoice)
    }

    /// Take back the latest payment applied under `receipt_ref`, for a
    /// payment whose ledger posting was refused.
    #[instrument(skip(self))]
    pub fn revert_payment(&self, id: InvoiceId, receipt_ref: &str) -> Result<Invoice> {
        let receipt_ref = receipt_ref.trim();
        let row = self.row(id)?;
        let mut row = row.lock();

        let status = row.invoice.status;
        if matches!(status, InvoiceStatus::Cancelled | InvoiceStatus::Refunded) {
            return Err(refused(status, "payment reversal"));
        }
        let Some(index) = row.payments.iter().rposition(|p| p.receipt_ref == receipt_ref) else {
            return Err(LedgerError::not_found(Entity::Receipt, receipt_ref));
        };
        let amount = row.payments[index].amount;
        if amount > row.invoice.paid {
            return Err(LedgerError::InvalidRefund {
                amount,
                paid: row.invoice.paid,
            });
        }
        let payment = row.payments.remove(index);

        let at = now();
        let invoice = &mut row.invoice;
        invoice.paid -= amount;
        invoice.recompute_balance();
        invoice.status = if invoice.paid.is_zero() && !invoice.is_past_due(at) {
            payment.prior_status
        } else {
            invoice.payment_status(at)
        };
        invoice.updated_at = at;
        let invoice = invoice.clone();

        if let Some(receipt) = self.receipts.get(&payment.receipt_id).map(|r| Arc::clone(&r)) {
            let mut receipt = receipt.lock();
            let share = amount.min(receipt.paid);
            receipt.record_refund(share, at);
        }
        drop(row);

        self.events.publish(LedgerEvent::InvoiceRefunded {
            invoice_id: id,
            amount,
            paid: invoice.paid,
        });
        warn!(invoice_id = %id, receipt_ref = %receipt_ref, amount = %amount, status = ?invoice.status, "Payment reverted");
        Ok(invoice)
    }

    pub fn invoice_count(&self) -> usize {
        self.invoices.len()
    }
}

fn refused(status: InvoiceStatus, action: &str) -> LedgerError {
    LedgerError::InvalidTransition {
        entity: Entity::Invoice,
        from: format!("{:?}", status),
        to: action.to_string(),
    }
}

fn check_invoice_payment(row: &InvoiceRow, amount: Decimal, receipt_ref: &str) -> Result<()> {
    let invoice = &row.invoice;
    if !invoice.status.accepts_payment() {
        return Err(refused(invoice.status, "payment"));
    }
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(amount));
    }
    if receipt_ref.is_empty() {
        return Err(LedgerError::validation("receipt reference is required", "receipt_ref"));
    }
    if row.payments.iter().any(|p| p.receipt_ref == receipt_ref) {
        return Err(LedgerError::DuplicatePayment {
            receipt_ref: receipt_ref.to_string(),
        });
    }
    if amount > invoice.balance {
        return Err(LedgerError::Overpayment {
            amount,
            balance: invoice.balance,
        });
    }
    Ok(())
}

fn check_receipt_payment(receipt: &Receipt, invoice: &Invoice, amount: Decimal) -> Result<()> {
    if receipt.status == ReceiptStatus::Paid {
        return Err(LedgerError::DuplicatePayment {
            receipt_ref: receipt.reference.clone(),
        });
    }
    if !receipt.status.accepts_payment() {
        return Err(LedgerError::transition(Entity::Receipt, receipt.status, ReceiptStatus::Paid));
    }
    if receipt.invoice_id.map_or(false, |linked| linked != invoice.id) {
        return Err(LedgerError::validation(
            format!("receipt {} belongs to another invoice", receipt.reference),
            "receipt_ref",
        ));
    }
    if receipt.currency != invoice.currency {
        return Err(LedgerError::validation(
            format!(
                "receipt currency {} differs from invoice currency {}",
                receipt.currency, invoice.currency
            ),
            "receipt_ref",
        ));
    }
    if amount > receipt.balance {
        return Err(LedgerError::Overpayment {
            amount,
            balance: receipt.balance,
        });
    }
    Ok(())
}

fn validate_invoice(new: &NewInvoice) -> Result<()> {
    if new.category.trim().is_empty() {
        return Err(LedgerError::validation("invoice category is required", "category"));
    }
    if !new.currency.is_valid() {
        return Err(LedgerError::validation(
            format!("invalid currency code {}", new.currency),
            "currency",
        ));
    }
    if new.payable <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(new.payable));
    }
    if new.currency.round(new.payable) != new.payable {
        return Err(LedgerError::validation(
            format!("payable {} exceeds {} precision", new.payable, new.currency),
            "payable",
        ));
    }
    if new.discount < Decimal::ZERO || new.discount >= new.payable {
        return Err(LedgerError::validation(
            format!("discount {} must be within [0, {})", new.discount, new.payable),
            "discount",
        ));
    }
    if new.tax_rate < Decimal::ZERO {
        return Err(LedgerError::validation("tax rate cannot be negative", "tax_rate"));
    }
    if new.exchange_rate <= Decimal::ZERO {
        return Err(LedgerError::validation("exchange rate must be positive", "exchange_rate"));
    }
    Ok(())
}
