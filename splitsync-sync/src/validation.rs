//! Structural validation of mutations before they touch the cache.
//!
//! Split arithmetic belongs to the host application and is reached through
//! [`SplitValidator`]. Everything here is about shape: non-empty fields,
//! positive amounts, currency codes, and the guest manager graph.

use splitsync_types::{
    CachedGroup, EntityId, ExpenseDraft, ExpenseItem, GroupDraft, GuestDraft, ParticipantKind,
    SettlementDraft, Split, SplitType,
};
use std::collections::HashSet;

/// Validates split payloads. Implemented by the host; the engine never
/// computes splits itself.
pub trait SplitValidator: Send + Sync {
    fn validate_splits(
        &self,
        amount: i64,
        split_type: SplitType,
        splits: &[Split],
        items: &[ExpenseItem],
    ) -> Result<(), String>;
}

/// Checks that owed amounts add up to the expense total.
///
/// Itemized expenses must have items summing to the total; percent splits
/// must also carry percentages summing to 100.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumSplitValidator;

impl SplitValidator for SumSplitValidator {
    fn validate_splits(
        &self,
        amount: i64,
        split_type: SplitType,
        splits: &[Split],
        items: &[ExpenseItem],
    ) -> Result<(), String> {
        if split_type == SplitType::Itemized {
            if items.is_empty() {
                return Err("itemized expense has no items".into());
            }
            let total: i64 = items.iter().map(|i| i.amount).sum();
            if total != amount {
                return Err(format!("items sum to {total}, expected {amount}"));
            }
            return Ok(());
        }

        if splits.is_empty() {
            return Err("expense has no splits".into());
        }
        let owed: i64 = splits.iter().map(|s| s.amount_owed).sum();
        if owed != amount {
            return Err(format!("splits sum to {owed}, expected {amount}"));
        }
        if split_type == SplitType::Percent {
            let pct: f64 = splits.iter().filter_map(|s| s.percentage).sum();
            if (pct - 100.0).abs() > 0.01 {
                return Err(format!("percentages sum to {pct}, expected 100"));
            }
        }
        Ok(())
    }
}

fn check_currency(code: &str) -> Result<(), String> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(format!("invalid currency code: {code:?}"))
    }
}

pub(crate) fn check_expense(
    draft: &ExpenseDraft,
    validator: &dyn SplitValidator,
) -> Result<(), String> {
    if draft.description.trim().is_empty() {
        return Err("description is empty".into());
    }
    if draft.amount <= 0 {
        return Err(format!("amount must be positive, got {}", draft.amount));
    }
    check_currency(&draft.currency)?;
    validator.validate_splits(draft.amount, draft.split_type, &draft.splits, &draft.items)
}

pub(crate) fn check_group(draft: &GroupDraft) -> Result<(), String> {
    if draft.name.trim().is_empty() {
        return Err("group name is empty".into());
    }
    check_currency(&draft.default_currency)
}

pub(crate) fn check_settlement(draft: &SettlementDraft) -> Result<(), String> {
    if draft.amount <= 0 {
        return Err(format!("amount must be positive, got {}", draft.amount));
    }
    if draft.payer_id == draft.payee_id && draft.payer_is_guest == draft.payee_is_guest {
        return Err("payer and payee are the same participant".into());
    }
    check_currency(&draft.currency)
}

pub(crate) fn check_guest(draft: &GuestDraft) -> Result<(), String> {
    if draft.name.trim().is_empty() {
        return Err("guest name is empty".into());
    }
    if draft.managed_by_id.is_some() != draft.managed_by_type.is_some() {
        return Err("managed_by id and type must be set together".into());
    }
    Ok(())
}

/// Every guest manager must exist in the group, and following managers from
/// any guest must end at a member or an unmanaged guest.
pub(crate) fn check_guest_managers(group: &CachedGroup) -> Result<(), String> {
    for guest in &group.guests {
        let mut seen: HashSet<&EntityId> = HashSet::new();
        seen.insert(&guest.id);
        let mut current = guest;
        while let Some((manager_id, kind)) = current.manager() {
            match kind {
                ParticipantKind::User => {
                    let known = manager_id
                        .as_canonical()
                        .is_some_and(|uid| group.has_member(uid));
                    if !known {
                        return Err(format!(
                            "guest {} is managed by {manager_id}, who is not a member",
                            current.id
                        ));
                    }
                    break;
                }
                ParticipantKind::Guest => {
                    let Some(next) = group.guest(manager_id) else {
                        return Err(format!(
                            "guest {} is managed by unknown guest {manager_id}",
                            current.id
                        ));
                    };
                    if !seen.insert(&next.id) {
                        return Err(format!("guest manager cycle through {}", guest.id));
                    }
                    current = next;
                }
            }
        }
    }
    Ok(())
}
