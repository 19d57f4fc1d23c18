//! Postgres wallet store
//!
//! Durable store. Every commit runs as one SQL transaction: a
//! version-guarded UPDATE on the account row is the serialization point
//! (zero rows updated means another writer got there first), then the
//! transaction row and the ledger entry land under the same commit. Claims
//! ride on the primary key of their table, so concurrent claimers resolve
//! in the database rather than in process memory.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use async_trait::async_trait;

use crate::domain::{
    Account, AccountStatus, Amount, Balance, EntryDirection, LedgerEntry, OperationContext,
    Transaction, TransactionKind, TransactionStatus,
};

use super::{
    ClaimInsert, ClaimRow, CommitRequest, StoreError, TransactionWrite, WalletStore,
};

type PgTx<'a> = sqlx::Transaction<'a, Postgres>;

type AccountRow = (
    Uuid,
    String,
    String,
    i64,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
);

type TransactionRow = (
    Uuid,
    Uuid,
    String,
    String,
    i64,
    String,
    serde_json::Value,
    Option<String>,
    Option<serde_json::Value>,
    serde_json::Value,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

type EntryRow = (
    Uuid,
    Uuid,
    Uuid,
    i64,
    String,
    i64,
    i64,
    String,
    DateTime<Utc>,
);

type ClaimDbRow = (
    String,
    String,
    Uuid,
    Option<Uuid>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const SELECT_TRANSACTION: &str = r#"
    SELECT id, account_id, kind, reference, amount_kobo, status, details,
           provider_reference, receipt, context, created_at, updated_at, finalized_at
    FROM transactions
"#;

const SELECT_ENTRY: &str = r#"
    SELECT id, account_id, transaction_id, seq, direction, amount_kobo,
           balance_after_kobo, description, created_at
    FROM ledger_entries
"#;

fn map_account(row: AccountRow) -> Result<Account, StoreError> {
    let (id, holder, status, balance_kobo, version, created_at, updated_at) = row;
    Ok(Account {
        id,
        holder,
        status: status.parse::<AccountStatus>().map_err(StoreError::Corrupt)?,
        balance: Balance::new(balance_kobo)
            .map_err(|e| StoreError::Corrupt(format!("account {id}: {e}")))?,
        version,
        created_at,
        updated_at,
    })
}

fn map_transaction(row: TransactionRow) -> Result<Transaction, StoreError> {
    let (
        id,
        account_id,
        kind,
        reference,
        amount_kobo,
        status,
        details,
        provider_reference,
        receipt,
        context,
        created_at,
        updated_at,
        finalized_at,
    ) = row;
    let context: OperationContext = serde_json::from_value(context)
        .map_err(|e| StoreError::Corrupt(format!("transaction {id} context: {e}")))?;
    Ok(Transaction {
        id,
        account_id,
        kind: kind.parse::<TransactionKind>().map_err(StoreError::Corrupt)?,
        reference,
        amount: Amount::from_kobo(amount_kobo)
            .map_err(|e| StoreError::Corrupt(format!("transaction {id}: {e}")))?,
        status: status
            .parse::<TransactionStatus>()
            .map_err(StoreError::Corrupt)?,
        details,
        provider_reference,
        receipt,
        context,
        created_at,
        updated_at,
        finalized_at,
    })
}

fn map_entry(row: EntryRow) -> Result<LedgerEntry, StoreError> {
    let (
        id,
        account_id,
        transaction_id,
        seq,
        direction,
        amount_kobo,
        balance_after_kobo,
        description,
        created_at,
    ) = row;
    Ok(LedgerEntry {
        id,
        account_id,
        transaction_id,
        seq,
        direction: direction
            .parse::<EntryDirection>()
            .map_err(StoreError::Corrupt)?,
        amount: Amount::from_kobo(amount_kobo)
            .map_err(|e| StoreError::Corrupt(format!("entry {id}: {e}")))?,
        balance_after: Balance::new(balance_after_kobo)
            .map_err(|e| StoreError::Corrupt(format!("entry {id}: {e}")))?,
        description,
        created_at,
    })
}

fn map_claim(row: ClaimDbRow) -> ClaimRow {
    let (reference, fingerprint, token, transaction_id, claimed_at, expires_at) = row;
    ClaimRow {
        reference,
        fingerprint,
        token,
        transaction_id,
        claimed_at,
        expires_at,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

/// Wallet store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PgStore with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Guarded account update inside a commit. Zero rows means either the
    /// account is gone or another writer moved the version.
    async fn move_account_balance(
        &self,
        tx: &mut PgTx<'_>,
        request: &CommitRequest,
    ) -> Result<(), StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE accounts
            SET balance_kobo = $2, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $3
            "#,
        )
        .bind(request.account_id)
        .bind(request.new_balance.kobo())
        .bind(request.expected_version)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if rows == 1 {
            return Ok(());
        }

        let actual: Option<i64> =
            sqlx::query_scalar(r#"SELECT version FROM accounts WHERE id = $1"#)
                .bind(request.account_id)
                .fetch_optional(&mut **tx)
                .await?;

        match actual {
            Some(actual) => Err(StoreError::VersionConflict {
                account_id: request.account_id,
                expected: request.expected_version,
                actual,
            }),
            None => Err(StoreError::AccountNotFound(request.account_id)),
        }
    }

    async fn write_transaction(
        &self,
        tx: &mut PgTx<'_>,
        write: &TransactionWrite,
    ) -> Result<(), StoreError> {
        match write {
            TransactionWrite::Insert(transaction) => {
                let context = serde_json::to_value(&transaction.context)?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO transactions (
                        id, account_id, kind, reference, amount_kobo, status,
                        details, provider_reference, receipt, context,
                        created_at, updated_at, finalized_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    "#,
                )
                .bind(transaction.id)
                .bind(transaction.account_id)
                .bind(transaction.kind.as_str())
                .bind(&transaction.reference)
                .bind(transaction.amount.kobo())
                .bind(transaction.status.as_str())
                .bind(&transaction.details)
                .bind(&transaction.provider_reference)
                .bind(&transaction.receipt)
                .bind(&context)
                .bind(transaction.created_at)
                .bind(transaction.updated_at)
                .bind(transaction.finalized_at)
                .execute(&mut **tx)
                .await;

                match result {
                    Ok(_) => Ok(()),
                    Err(e) if is_unique_violation(&e) => {
                        Err(StoreError::DuplicateReference(transaction.reference.clone()))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            TransactionWrite::Update {
                expected_status,
                transaction,
            } => {
                let context = serde_json::to_value(&transaction.context)?;
                // amount_kobo is rewritten too: top-up settlement replaces
                // the claimed amount with the provider-verified one.
                let rows = sqlx::query(
                    r#"
                    UPDATE transactions
                    SET status = $2, amount_kobo = $3, details = $4, provider_reference = $5,
                        receipt = $6, context = $7, updated_at = $8, finalized_at = $9
                    WHERE id = $1 AND status = $10
                    "#,
                )
                .bind(transaction.id)
                .bind(transaction.status.as_str())
                .bind(transaction.amount.kobo())
                .bind(&transaction.details)
                .bind(&transaction.provider_reference)
                .bind(&transaction.receipt)
                .bind(&context)
                .bind(transaction.updated_at)
                .bind(transaction.finalized_at)
                .bind(expected_status.as_str())
                .execute(&mut **tx)
                .await?
                .rows_affected();

                if rows == 1 {
                    return Ok(());
                }

                let actual: Option<String> =
                    sqlx::query_scalar(r#"SELECT status FROM transactions WHERE id = $1"#)
                        .bind(transaction.id)
                        .fetch_optional(&mut **tx)
                        .await?;

                match actual {
                    Some(actual) => Err(StoreError::StatusConflict {
                        transaction_id: transaction.id,
                        expected: *expected_status,
                        actual: actual
                            .parse::<TransactionStatus>()
                            .map_err(StoreError::Corrupt)?,
                    }),
                    None => Err(StoreError::TransactionNotFound(transaction.id)),
                }
            }
        }
    }

    async fn write_entry(
        &self,
        tx: &mut PgTx<'_>,
        entry: &LedgerEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, account_id, transaction_id, seq, direction,
                amount_kobo, balance_after_kobo, description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.account_id)
        .bind(entry.transaction_id)
        .bind(entry.seq)
        .bind(entry.direction.as_str())
        .bind(entry.amount.kobo())
        .bind(entry.balance_after.kobo())
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl WalletStore for PgStore {
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, holder, status, balance_kobo, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(account.id)
        .bind(&account.holder)
        .bind(account.status.as_str())
        .bind(account.balance.kobo())
        .bind(account.version)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, holder, status, balance_kobo, version, created_at, updated_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_account).transpose()
    }

    async fn set_account_status(
        &self,
        account_id: Uuid,
        status: AccountStatus,
    ) -> Result<(), StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE accounts SET status = $2, updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(StoreError::AccountNotFound(account_id));
        }

        Ok(())
    }

    async fn commit(&self, request: CommitRequest) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        self.move_account_balance(&mut tx, &request).await?;
        self.write_transaction(&mut tx, &request.transaction).await?;
        self.write_entry(&mut tx, &request.entry).await?;

        tx.commit().await?;

        Ok(())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        let context = serde_json::to_value(&transaction.context)?;
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, account_id, kind, reference, amount_kobo, status,
                details, provider_reference, receipt, context,
                created_at, updated_at, finalized_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.account_id)
        .bind(transaction.kind.as_str())
        .bind(&transaction.reference)
        .bind(transaction.amount.kobo())
        .bind(transaction.status.as_str())
        .bind(&transaction.details)
        .bind(&transaction.provider_reference)
        .bind(&transaction.receipt)
        .bind(&context)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .bind(transaction.finalized_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::DuplicateReference(transaction.reference.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize_transaction(
        &self,
        expected_status: TransactionStatus,
        transaction: &Transaction,
    ) -> Result<bool, StoreError> {
        let context = serde_json::to_value(&transaction.context)?;
        let rows = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2, amount_kobo = $3, details = $4, provider_reference = $5,
                receipt = $6, context = $7, updated_at = $8, finalized_at = $9
            WHERE id = $1 AND status = $10
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.status.as_str())
        .bind(transaction.amount.kobo())
        .bind(&transaction.details)
        .bind(&transaction.provider_reference)
        .bind(&transaction.receipt)
        .bind(&context)
        .bind(transaction.updated_at)
        .bind(transaction.finalized_at)
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 1 {
            return Ok(true);
        }

        let exists: Option<i32> =
            sqlx::query_scalar(r#"SELECT 1 FROM transactions WHERE id = $1"#)
                .bind(transaction.id)
                .fetch_optional(&self.pool)
                .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::TransactionNotFound(transaction.id)),
        }
    }

    async fn fetch_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        let row: Option<TransactionRow> =
            sqlx::query_as(&format!("{SELECT_TRANSACTION} WHERE id = $1"))
                .bind(transaction_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(map_transaction).transpose()
    }

    async fn fetch_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let row: Option<TransactionRow> =
            sqlx::query_as(&format!("{SELECT_TRANSACTION} WHERE reference = $1"))
                .bind(reference)
                .fetch_optional(&self.pool)
                .await?;

        row.map(map_transaction).transpose()
    }

    async fn transactions_for_account(
        &self,
        account_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            {SELECT_TRANSACTION}
            WHERE account_id = $1 AND ($2::timestamptz IS NULL OR created_at < $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(account_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_transaction).collect()
    }

    async fn transactions_in_status_since(
        &self,
        status: TransactionStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            {SELECT_TRANSACTION}
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(status.as_str())
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_transaction).collect()
    }

    async fn entries_for_account(
        &self,
        account_id: Uuid,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            r#"
            {SELECT_ENTRY}
            WHERE account_id = $1 AND ($2::bigint IS NULL OR seq < $2)
            ORDER BY seq DESC
            LIMIT $3
            "#
        ))
        .bind(account_id)
        .bind(before_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_entry).collect()
    }

    async fn head_entry(&self, account_id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "{SELECT_ENTRY} WHERE account_id = $1 ORDER BY seq DESC LIMIT 1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_entry).transpose()
    }

    async fn insert_claim(&self, row: ClaimRow) -> Result<ClaimInsert, StoreError> {
        // Losing the insert race and then finding the winner's row deleted
        // is possible when a claim is released between the two statements,
        // so take one more swing before giving up.
        for _ in 0..2 {
            let inserted: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO reference_claims
                    (reference, fingerprint, token, transaction_id, claimed_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (reference) DO NOTHING
                RETURNING reference
                "#,
            )
            .bind(&row.reference)
            .bind(&row.fingerprint)
            .bind(row.token)
            .bind(row.transaction_id)
            .bind(row.claimed_at)
            .bind(row.expires_at)
            .fetch_optional(&self.pool)
            .await?;

            if inserted.is_some() {
                return Ok(ClaimInsert::Inserted);
            }

            if let Some(existing) = self.fetch_claim(&row.reference).await? {
                return Ok(ClaimInsert::Existing(existing));
            }
        }

        Err(StoreError::Corrupt(format!(
            "claim row for {} kept vanishing during insert",
            row.reference
        )))
    }

    async fn fetch_claim(&self, reference: &str) -> Result<Option<ClaimRow>, StoreError> {
        let row: Option<ClaimDbRow> = sqlx::query_as(
            r#"
            SELECT reference, fingerprint, token, transaction_id, claimed_at, expires_at
            FROM reference_claims
            WHERE reference = $1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(map_claim))
    }

    async fn replace_claim(
        &self,
        reference: &str,
        old_token: Uuid,
        row: ClaimRow,
    ) -> Result<bool, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE reference_claims
            SET fingerprint = $3, token = $4, claimed_at = $5, expires_at = $6
            WHERE reference = $1 AND token = $2 AND transaction_id IS NULL
            "#,
        )
        .bind(reference)
        .bind(old_token)
        .bind(&row.fingerprint)
        .bind(row.token)
        .bind(row.claimed_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn bind_claim(
        &self,
        reference: &str,
        token: Uuid,
        transaction_id: Uuid,
    ) -> Result<bool, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE reference_claims
            SET transaction_id = $3
            WHERE reference = $1 AND token = $2 AND transaction_id IS NULL
            "#,
        )
        .bind(reference)
        .bind(token)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn release_claim(&self, reference: &str, token: Uuid) -> Result<bool, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM reference_claims
            WHERE reference = $1 AND token = $2 AND transaction_id IS NULL
            "#,
        )
        .bind(reference)
        .bind(token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn delete_expired_claims(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM reference_claims WHERE expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_account_rejects_unknown_status() {
        let now = Utc::now();
        let row: AccountRow = (
            Uuid::new_v4(),
            "holder".into(),
            "frozen".into(),
            0,
            0,
            now,
            now,
        );
        assert!(matches!(map_account(row), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_map_account_rejects_negative_balance() {
        let now = Utc::now();
        let row: AccountRow = (
            Uuid::new_v4(),
            "holder".into(),
            "active".into(),
            -100,
            3,
            now,
            now,
        );
        assert!(matches!(map_account(row), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_map_transaction_round_trip() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let row: TransactionRow = (
            id,
            Uuid::new_v4(),
            "AIRTIME".into(),
            "TX_abc".into(),
            50_000,
            "RESERVED".into(),
            serde_json::json!({"phone": "0803"}),
            Some("prov-1".into()),
            None,
            serde_json::json!({"initiator": "account_holder"}),
            now,
            now,
            None,
        );

        let tx = map_transaction(row).unwrap();
        assert_eq!(tx.id, id);
        assert_eq!(tx.kind, TransactionKind::Airtime);
        assert_eq!(tx.status, TransactionStatus::Reserved);
        assert_eq!(tx.amount.kobo(), 50_000);
        assert_eq!(tx.provider_reference.as_deref(), Some("prov-1"));
    }
}
