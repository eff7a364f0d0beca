//! Cached entity tables: users, groups, expenses, balances, exchange rates.

use super::helpers::{collect_json, from_json, key, to_json};
use super::{StoreChange, StoreTxn};
use crate::error::StorageResult;
use rusqlite::{params, OptionalExtension};
use splitsync_types::{
    CachedBalance, CachedExpense, CachedGroup, CachedUser, EntityId, EntityState, EntityType,
    ExchangeRate,
};

impl StoreTxn<'_> {
    // ---- users ----

    pub fn put_user(&self, user: &CachedUser) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO users (id, data_json, cached_at) VALUES (?1, ?2, ?3)",
            params![user.id, to_json(user)?, user.cached_at],
        )?;
        self.record(StoreChange::Upserted {
            entity_type: EntityType::User,
            id: EntityId::Canonical(user.id),
        });
        Ok(())
    }

    pub fn get_user(&self, id: i64) -> StorageResult<Option<CachedUser>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT data_json FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    pub fn list_users(&self) -> StorageResult<Vec<CachedUser>> {
        let mut stmt = self.conn.prepare("SELECT data_json FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_json(rows)
    }

    /// Replaces the whole friends cache.
    pub fn replace_users(&self, users: &[CachedUser]) -> StorageResult<()> {
        self.conn.execute("DELETE FROM users", [])?;
        for user in users {
            self.put_user(user)?;
        }
        Ok(())
    }

    // ---- groups ----

    pub fn put_group(&self, group: &CachedGroup) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO groups (id, data_json, is_temp, sync_state, local_version, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key(&group.id),
                to_json(group)?,
                group.is_temp(),
                group.sync_state.as_str(),
                group.local_version as i64,
                group.cached_at,
            ],
        )?;
        self.record(StoreChange::Upserted {
            entity_type: EntityType::Group,
            id: group.id.clone(),
        });
        Ok(())
    }

    pub fn get_group(&self, id: &EntityId) -> StorageResult<Option<CachedGroup>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM groups WHERE id = ?1",
                [key(id)],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    /// All cached groups, sorted by name.
    pub fn list_groups(&self) -> StorageResult<Vec<CachedGroup>> {
        let mut stmt = self.conn.prepare("SELECT data_json FROM groups")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut groups: Vec<CachedGroup> = collect_json(rows)?;
        groups.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(groups)
    }

    pub fn delete_group(&self, id: &EntityId) -> StorageResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM groups WHERE id = ?1", [key(id)])?;
        if n > 0 {
            self.record(StoreChange::Removed {
                entity_type: EntityType::Group,
                id: id.clone(),
            });
        }
        Ok(n > 0)
    }

    // ---- expenses ----

    pub fn put_expense(&self, expense: &CachedExpense) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO expenses
                (id, group_id, data_json, is_temp, sync_state, local_version, expense_date, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key(&expense.id),
                expense.group_id.as_ref().map(key),
                to_json(expense)?,
                expense.is_temp(),
                expense.sync_state.as_str(),
                expense.local_version as i64,
                expense.date.to_string(),
                expense.cached_at,
            ],
        )?;
        self.record(StoreChange::Upserted {
            entity_type: EntityType::Expense,
            id: expense.id.clone(),
        });
        Ok(())
    }

    pub fn get_expense(&self, id: &EntityId) -> StorageResult<Option<CachedExpense>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM expenses WHERE id = ?1",
                [key(id)],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    /// Expenses of one group, newest first.
    pub fn expenses_for_group(&self, group_id: &EntityId) -> StorageResult<Vec<CachedExpense>> {
        let mut stmt = self.conn.prepare(
            "SELECT data_json FROM expenses WHERE group_id = ?1
             ORDER BY expense_date DESC, cached_at DESC",
        )?;
        let rows = stmt.query_map([key(group_id)], |row| row.get::<_, String>(0))?;
        collect_json(rows)
    }

    /// Every cached expense, newest first.
    pub fn list_expenses(&self) -> StorageResult<Vec<CachedExpense>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data_json FROM expenses ORDER BY expense_date DESC, cached_at DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_json(rows)
    }

    pub fn delete_expense(&self, id: &EntityId) -> StorageResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM expenses WHERE id = ?1", [key(id)])?;
        if n > 0 {
            self.record(StoreChange::Removed {
                entity_type: EntityType::Expense,
                id: id.clone(),
            });
        }
        Ok(n > 0)
    }

    /// Sets the sync state of a group or expense row. Returns false if the row is missing.
    pub fn set_sync_state(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        state: EntityState,
    ) -> StorageResult<bool> {
        match entity_type {
            EntityType::Group => match self.get_group(id)? {
                Some(mut group) if group.sync_state != state => {
                    group.sync_state = state;
                    self.put_group(&group)?;
                    Ok(true)
                }
                Some(_) => Ok(true),
                None => Ok(false),
            },
            EntityType::Expense => match self.get_expense(id)? {
                Some(mut expense) if expense.sync_state != state => {
                    expense.sync_state = state;
                    self.put_expense(&expense)?;
                    Ok(true)
                }
                Some(_) => Ok(true),
                None => Ok(false),
            },
            _ => Ok(false),
        }
    }

    // ---- balances ----

    /// Replaces the whole balances cache with a server snapshot.
    pub fn replace_balances(&self, balances: &[CachedBalance]) -> StorageResult<()> {
        self.conn.execute("DELETE FROM balances", [])?;
        for balance in balances {
            self.put_balance(balance)?;
        }
        self.record(StoreChange::BalancesReplaced);
        Ok(())
    }

    pub(super) fn put_balance(&self, balance: &CachedBalance) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO balances (key, group_id, data_json, cached_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                balance.key(),
                balance.group_id.as_ref().map(key),
                to_json(balance)?,
                balance.cached_at,
            ],
        )?;
        Ok(())
    }

    /// Balances scoped to one group, or the cross-group totals when `group_id` is `None`.
    pub fn balances(&self, group_id: Option<&EntityId>) -> StorageResult<Vec<CachedBalance>> {
        let rows: Vec<CachedBalance> = match group_id {
            Some(group_id) => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT data_json FROM balances WHERE group_id = ?1 ORDER BY key")?;
                let rows = stmt.query_map([key(group_id)], |row| row.get::<_, String>(0))?;
                collect_json(rows)?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT data_json FROM balances WHERE group_id IS NULL ORDER BY key")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                collect_json(rows)?
            }
        };
        Ok(rows)
    }

    pub fn list_balances(&self) -> StorageResult<Vec<CachedBalance>> {
        let mut stmt = self.conn.prepare("SELECT data_json FROM balances ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_json(rows)
    }

    // ---- exchange rates ----

    pub fn put_exchange_rates(&self, rates: &[ExchangeRate]) -> StorageResult<()> {
        let mut stmt = self.conn.prepare(
            "INSERT OR REPLACE INTO exchange_rates (base, quote, rate, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for rate in rates {
            stmt.execute(params![rate.base, rate.quote, rate.rate, rate.fetched_at])?;
        }
        if !rates.is_empty() {
            self.record(StoreChange::ExchangeRatesUpdated);
        }
        Ok(())
    }

    pub fn exchange_rate(&self, base: &str, quote: &str) -> StorageResult<Option<ExchangeRate>> {
        let rate = self
            .conn
            .query_row(
                "SELECT base, quote, rate, fetched_at FROM exchange_rates
                 WHERE base = ?1 AND quote = ?2",
                [base, quote],
                |row| {
                    Ok(ExchangeRate {
                        base: row.get(0)?,
                        quote: row.get(1)?,
                        rate: row.get(2)?,
                        fetched_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(rate)
    }

    /// Every cached rate quoted against `base`.
    pub fn exchange_rates_for(&self, base: &str) -> StorageResult<Vec<ExchangeRate>> {
        let mut stmt = self.conn.prepare(
            "SELECT base, quote, rate, fetched_at FROM exchange_rates
             WHERE base = ?1 ORDER BY quote",
        )?;
        let rows = stmt.query_map([base], |row| {
            Ok(ExchangeRate {
                base: row.get(0)?,
                quote: row.get(1)?,
                rate: row.get(2)?,
                fetched_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
