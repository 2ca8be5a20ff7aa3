//! Ready-to-post entry sets for the recurring money movements. Every
//! template is balanced by construction and re-checked before it is
//! returned, so a posting command built from one can only fail on
//! account-level preconditions.

use caricash_money::Amount;
use caricash_money::Currency;

use crate::AccountRef;
use crate::AccountType;
use crate::CommandEntry;
use crate::EntrySide;
use crate::LedgerError;
use crate::LedgerResult;
use crate::OwnerType;
use crate::TxnType;

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateOutput {
    pub txn_type: TxnType,
    pub currency: Currency,
    pub entries: Vec<CommandEntry>,
}

fn entry(account: AccountRef, side: EntrySide, amount: Amount, description: &str) -> CommandEntry {
    CommandEntry {
        account,
        side,
        amount,
        description: description.into(),
    }
}

fn push_if_positive(entries: &mut Vec<CommandEntry>, candidate: CommandEntry) {
    if candidate.amount.is_positive() {
        entries.push(candidate);
    }
}

fn ensure_balanced(entries: &[CommandEntry]) -> LedgerResult<()> {
    let mut debits = Amount::ZERO;
    let mut credits = Amount::ZERO;
    for entry in entries {
        if !entry.amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "template produced a non-positive entry of {}",
                entry.amount
            )));
        }
        match entry.side {
            EntrySide::Debit => debits = debits.checked_add(entry.amount)?,
            EntrySide::Credit => credits = credits.checked_add(entry.amount)?,
        }
    }
    if debits != credits {
        return Err(LedgerError::Unbalanced { debits, credits });
    }
    Ok(())
}

fn finish(txn_type: TxnType, currency: Currency, entries: Vec<CommandEntry>) -> LedgerResult<TemplateOutput> {
    ensure_balanced(&entries)?;
    Ok(TemplateOutput {
        txn_type,
        currency,
        entries,
    })
}

fn bank_pool() -> AccountRef {
    AccountRef::owner(OwnerType::System, "bank", AccountType::BankPool)
}

fn fee_revenue() -> AccountRef {
    AccountRef::owner(OwnerType::System, "platform", AccountType::Fee)
}

fn tax_payable() -> AccountRef {
    AccountRef::owner(OwnerType::System, "platform", AccountType::TaxPayable)
}

fn clearing_outbound() -> AccountRef {
    AccountRef::owner(OwnerType::System, "clearing-outbound", AccountType::Clearing)
}

fn platform_pool() -> AccountRef {
    AccountRef::owner(OwnerType::System, "platform", AccountType::Wallet)
}

/// Gross deposit into a customer wallet with platform fee and tax carved
/// out: DR bank pool for the gross, CR wallet for the net, CR fee revenue,
/// CR tax payable. Zero fee or tax legs are omitted.
pub fn deposit_with_fee(
    owner_type: OwnerType,
    owner_id: &str,
    currency: Currency,
    gross: Amount,
    fee: Amount,
    tax: Amount,
) -> LedgerResult<TemplateOutput> {
    if !gross.is_positive() {
        return Err(LedgerError::Validation("gross must be positive".into()));
    }
    if fee.is_negative() || tax.is_negative() {
        return Err(LedgerError::Validation(
            "fee and tax cannot be negative".into(),
        ));
    }
    let net = gross.checked_sub(fee)?.checked_sub(tax)?;
    if !net.is_positive() {
        return Err(LedgerError::Validation(format!(
            "fee {fee} and tax {tax} consume the whole deposit of {gross}"
        )));
    }

    let wallet = AccountRef::owner(owner_type, owner_id, AccountType::Wallet);
    let mut entries = vec![entry(bank_pool(), EntrySide::Debit, gross, "gross deposit")];
    push_if_positive(&mut entries, entry(wallet, EntrySide::Credit, net, "net wallet credit"));
    push_if_positive(&mut entries, entry(fee_revenue(), EntrySide::Credit, fee, "deposit fee"));
    push_if_positive(&mut entries, entry(tax_payable(), EntrySide::Credit, tax, "deposit tax"));
    finish(TxnType::Deposit, currency, entries)
}

/// Merchant settlement with the platform fee withheld on the way out.
pub fn settlement_fee(
    merchant_id: &str,
    currency: Currency,
    gross: Amount,
    fee: Amount,
) -> LedgerResult<TemplateOutput> {
    if !gross.is_positive() {
        return Err(LedgerError::Validation("gross must be positive".into()));
    }
    if fee.is_negative() || fee >= gross {
        return Err(LedgerError::Validation(format!(
            "fee {fee} must stay below the gross of {gross}"
        )));
    }
    let net = gross.checked_sub(fee)?;
    let wallet = AccountRef::owner(OwnerType::Merchant, merchant_id, AccountType::Wallet);
    let mut entries = vec![entry(wallet, EntrySide::Debit, gross, "settlement gross")];
    push_if_positive(
        &mut entries,
        entry(clearing_outbound(), EntrySide::Credit, net, "outbound clearing"),
    );
    push_if_positive(&mut entries, entry(fee_revenue(), EntrySide::Credit, fee, "settlement fee"));
    finish(TxnType::SettlementFee, currency, entries)
}

/// Pays accrued commissions out of the payable account, split between the
/// agent and the platform pool with HALF_UP rounding on the agent share.
/// The two shares always sum exactly to the total.
pub fn commission_split(
    agent_id: &str,
    currency: Currency,
    total: Amount,
    agent_basis_points: i64,
) -> LedgerResult<TemplateOutput> {
    if !total.is_positive() {
        return Err(LedgerError::Validation("total must be positive".into()));
    }
    if !(0..=10_000).contains(&agent_basis_points) {
        return Err(LedgerError::Validation(format!(
            "agent share must be between 0 and 10000 basis points, got {agent_basis_points}"
        )));
    }
    let (agent_share, platform_share) = total.split_half_up(agent_basis_points, 10_000)?;

    let payable = AccountRef::owner(OwnerType::System, "platform", AccountType::CommissionsPayable);
    let agent_wallet = AccountRef::owner(OwnerType::Agent, agent_id, AccountType::Wallet);
    let mut entries = vec![entry(payable, EntrySide::Debit, total, "commission payout")];
    push_if_positive(
        &mut entries,
        entry(agent_wallet, EntrySide::Credit, agent_share, "agent share"),
    );
    push_if_positive(
        &mut entries,
        entry(platform_pool(), EntrySide::Credit, platform_share, "platform share"),
    );
    finish(TxnType::CommissionSplit, currency, entries)
}

pub fn tax_withholding(
    merchant_id: &str,
    currency: Currency,
    tax: Amount,
) -> LedgerResult<TemplateOutput> {
    if !tax.is_positive() {
        return Err(LedgerError::Validation("tax must be positive".into()));
    }
    let wallet = AccountRef::owner(OwnerType::Merchant, merchant_id, AccountType::Wallet);
    finish(
        TxnType::TaxWithholding,
        currency,
        vec![
            entry(wallet, EntrySide::Debit, tax, "withheld tax"),
            entry(tax_payable(), EntrySide::Credit, tax, "tax payable"),
        ],
    )
}

/// Moves merchant funds into the holdback reserve.
pub fn holdback_reserve(
    merchant_id: &str,
    currency: Currency,
    amount: Amount,
) -> LedgerResult<TemplateOutput> {
    holdback(merchant_id, currency, amount, TxnType::HoldbackReserve)
}

/// Releases previously reserved funds back to the merchant wallet.
pub fn holdback_release(
    merchant_id: &str,
    currency: Currency,
    amount: Amount,
) -> LedgerResult<TemplateOutput> {
    holdback(merchant_id, currency, amount, TxnType::HoldbackRelease)
}

fn holdback(
    merchant_id: &str,
    currency: Currency,
    amount: Amount,
    txn_type: TxnType,
) -> LedgerResult<TemplateOutput> {
    if !amount.is_positive() {
        return Err(LedgerError::Validation("amount must be positive".into()));
    }
    let wallet = AccountRef::owner(OwnerType::Merchant, merchant_id, AccountType::Wallet);
    let reserve = AccountRef::owner(OwnerType::Merchant, merchant_id, AccountType::HoldbackReserve);
    let (debit, credit) = match txn_type {
        TxnType::HoldbackRelease => (reserve, wallet),
        _ => (wallet, reserve),
    };
    finish(
        txn_type,
        currency,
        vec![
            entry(debit, EntrySide::Debit, amount, "holdback movement"),
            entry(credit, EntrySide::Credit, amount, "holdback movement"),
        ],
    )
}

/// Settles a residual rounding difference against the system suspense
/// account. A zero difference yields an empty, postable-nowhere entry set.
pub fn rounding_adjustment(
    target: AccountRef,
    currency: Currency,
    difference: Amount,
) -> LedgerResult<TemplateOutput> {
    if difference.is_zero() {
        return Ok(TemplateOutput {
            txn_type: TxnType::RoundingAdjustment,
            currency,
            entries: Vec::new(),
        });
    }
    let suspense = AccountRef::owner(OwnerType::System, "rounding", AccountType::Suspense);
    let magnitude = difference.abs();
    let entries = if difference.is_positive() {
        vec![
            entry(suspense, EntrySide::Debit, magnitude, "rounding difference"),
            entry(target, EntrySide::Credit, magnitude, "rounding difference"),
        ]
    } else {
        vec![
            entry(target, EntrySide::Debit, magnitude, "rounding difference"),
            entry(suspense, EntrySide::Credit, magnitude, "rounding difference"),
        ]
    };
    finish(TxnType::RoundingAdjustment, currency, entries)
}
