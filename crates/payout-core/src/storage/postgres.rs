use crate::balance::BalanceInputs;
use crate::error::StoreError;
use crate::flow::WithdrawalStage;
use crate::journal::{JournalEntry, JournalEntryKind};
use crate::money::{Money, Rate};
use crate::store::{BankAccountStore, ChallengeStore, CommitScope, JournalStore, PayoutStore};
use crate::types::{
    BankAccount, BankAccountStatus, FeeFields, PasscodePurpose, Transaction, TransactionStatus,
    Withdrawal, WithdrawalChallenge, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};

const TRANSACTION_COLUMNS: &str = r#"
    id,
    user_id,
    gross_amount,
    payment_method,
    settlement_days,
    affiliate_commission_bps,
    status,
    platform_fee,
    acquirer_fee,
    commission_amount,
    net_amount,
    created_at,
    fees_corrected_at
"#;

const WITHDRAWAL_COLUMNS: &str = r#"
    id,
    user_id,
    requested_amount,
    fee,
    net_amount,
    bank_account_id,
    status,
    idempotency_key,
    created_at
"#;

const CHALLENGE_COLUMNS: &str = r#"
    challenge_id,
    user_id,
    purpose,
    requested_amount,
    bank_account_id,
    stage,
    attempts,
    issued_at,
    expires_at,
    withdrawal_id
"#;

/// PostgreSQL-backed store. Queries are runtime-checked so the crate builds
/// without a live database.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS payout_transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                gross_amount BIGINT NOT NULL,
                payment_method TEXT NOT NULL,
                settlement_days INTEGER NOT NULL,
                affiliate_commission_bps INTEGER NULL,
                status TEXT NOT NULL,
                platform_fee BIGINT NOT NULL,
                acquirer_fee BIGINT NOT NULL,
                commission_amount BIGINT NOT NULL,
                net_amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                fees_corrected_at TIMESTAMPTZ NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_payout_transactions_user ON payout_transactions (user_id, status)",
            r#"
            CREATE TABLE IF NOT EXISTS payout_withdrawals (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                requested_amount BIGINT NOT NULL,
                fee BIGINT NOT NULL,
                net_amount BIGINT NOT NULL,
                bank_account_id TEXT NOT NULL,
                status TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_payout_withdrawals_user ON payout_withdrawals (user_id, created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS payout_bank_accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS payout_withdrawal_challenges (
                challenge_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                purpose TEXT NOT NULL,
                requested_amount BIGINT NOT NULL,
                bank_account_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                issued_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                withdrawal_id TEXT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_payout_challenges_open ON payout_withdrawal_challenges (user_id, purpose, stage)",
            r#"
            CREATE TABLE IF NOT EXISTS payout_journal_entries (
                journal_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("postgres schema create failed: {e}")))?;
        }
        Ok(())
    }

    /// Insert a checkout transaction. The checkout process owns these rows;
    /// this exists for fixtures and backfills.
    pub async fn insert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payout_transactions (
                id, user_id, gross_amount, payment_method, settlement_days,
                affiliate_commission_bps, status, platform_fee, acquirer_fee,
                commission_amount, net_amount, created_at, fees_corrected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&transaction.id)
        .bind(&transaction.user_id)
        .bind(transaction.gross_amount.minor())
        .bind(transaction.payment_method.as_str())
        .bind(i32::from(transaction.settlement_days))
        .bind(
            transaction
                .affiliate_commission_percent
                .map(|rate| rate.bps() as i32),
        )
        .bind(transaction.status.as_str())
        .bind(transaction.fees.platform_fee.minor())
        .bind(transaction.fees.acquirer_fee.minor())
        .bind(transaction.fees.commission_amount.minor())
        .bind(transaction.fees.net_amount.minor())
        .bind(transaction.created_at)
        .bind(transaction.fees_corrected_at)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("insert transaction", e))?;
        Ok(())
    }

    pub async fn upsert_bank_account(&self, account: &BankAccount) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payout_bank_accounts (id, user_id, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET user_id = EXCLUDED.user_id, status = EXCLUDED.status
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(account.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| backend("upsert bank account", e))?;
        Ok(())
    }
}

#[async_trait]
impl PayoutStore for PostgresStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn transactions_for_user(
        &self,
        user_id: &str,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<Transaction>, StoreError> {
        let statuses: Vec<String> = statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payout_transactions \
             WHERE user_id = $1 AND status = ANY($2) ORDER BY created_at ASC, id ASC"
        ))
        .bind(user_id)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("load transactions", e))?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn transaction(&self, transaction_id: &str) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payout_transactions WHERE id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("load transaction", e))?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn update_fee_fields(
        &self,
        transaction_id: &str,
        fees: &FeeFields,
        corrected_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payout_transactions
            SET platform_fee = $2,
                acquirer_fee = $3,
                commission_amount = $4,
                net_amount = $5,
                fees_corrected_at = $6
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(fees.platform_fee.minor())
        .bind(fees.acquirer_fee.minor())
        .bind(fees.commission_amount.minor())
        .bind(fees.net_amount.minor())
        .bind(corrected_at)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("update fee fields", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("transaction '{transaction_id}'")));
        }
        Ok(())
    }

    async fn balance_inputs(&self, user_id: &str) -> Result<BalanceInputs, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| backend("acquire connection", e))?;
        balance_inputs_on(&mut *conn, user_id).await
    }

    async fn latest_withdrawal_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            "SELECT MAX(created_at) AS latest FROM payout_withdrawals WHERE user_id = $1 AND status <> 'rejected'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| backend("load latest withdrawal", e))?;

        column(&row, "latest")
    }

    async fn withdrawal(&self, withdrawal_id: &str) -> Result<Option<Withdrawal>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM payout_withdrawals WHERE id = $1"
        ))
        .bind(withdrawal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("load withdrawal", e))?;

        row.as_ref().map(withdrawal_from_row).transpose()
    }

    async fn withdrawals_for_user(&self, user_id: &str) -> Result<Vec<Withdrawal>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM payout_withdrawals WHERE user_id = $1 ORDER BY created_at ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("load withdrawals", e))?;

        rows.iter().map(withdrawal_from_row).collect()
    }

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: &str,
        status: WithdrawalStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE payout_withdrawals SET status = $2 WHERE id = $1")
            .bind(withdrawal_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| backend("update withdrawal status", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("withdrawal '{withdrawal_id}'")));
        }
        Ok(())
    }

    async fn begin_commit(&self, user_id: &str) -> Result<Box<dyn CommitScope>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("begin transaction", e))?;

        // Held until commit or rollback; serializes commits per user across nodes.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("acquire advisory lock", e))?;

        Ok(Box::new(PostgresCommitScope {
            user_id: user_id.to_string(),
            tx,
        }))
    }
}

struct PostgresCommitScope {
    user_id: String,
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl CommitScope for PostgresCommitScope {
    async fn balance_inputs(&mut self) -> Result<BalanceInputs, StoreError> {
        balance_inputs_on(&mut *self.tx, &self.user_id).await
    }

    async fn find_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Withdrawal>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM payout_withdrawals WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| backend("load withdrawal by idempotency key", e))?;

        row.as_ref().map(withdrawal_from_row).transpose()
    }

    async fn insert_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payout_withdrawals (
                id, user_id, requested_amount, fee, net_amount,
                bank_account_id, status, idempotency_key, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&withdrawal.id)
        .bind(&withdrawal.user_id)
        .bind(withdrawal.requested_amount.minor())
        .bind(withdrawal.fee.minor())
        .bind(withdrawal.net_amount.minor())
        .bind(&withdrawal.bank_account_id)
        .bind(withdrawal.status.as_str())
        .bind(&withdrawal.idempotency_key)
        .bind(withdrawal.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(format!(
                "idempotency key '{}' already used",
                withdrawal.idempotency_key
            )),
            other => backend("insert withdrawal", other),
        })?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let scope = *self;
        scope
            .tx
            .commit()
            .await
            .map_err(|e| backend("commit transaction", e))
    }
}

#[async_trait]
impl BankAccountStore for PostgresStore {
    async fn bank_account(
        &self,
        bank_account_id: &str,
        user_id: &str,
    ) -> Result<Option<BankAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, status FROM payout_bank_accounts WHERE id = $1 AND user_id = $2",
        )
        .bind(bank_account_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("load bank account", e))?;

        row.map(|row| {
            let status: String = column(&row, "status")?;
            Ok(BankAccount {
                id: column(&row, "id")?,
                user_id: column(&row, "user_id")?,
                status: parse_column::<BankAccountStatus>("status", &status)?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl ChallengeStore for PostgresStore {
    async fn save_challenge(&self, challenge: &WithdrawalChallenge) -> Result<(), StoreError> {
        upsert_challenge(challenge)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("save challenge", e))?;
        Ok(())
    }

    async fn replace_open_challenge(
        &self,
        challenge: &WithdrawalChallenge,
    ) -> Result<Vec<String>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("begin challenge replace", e))?;

        // Seed 1 keeps this lock apart from the withdrawal commit lock.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 1))")
            .bind(&challenge.user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("acquire challenge lock", e))?;

        let rows = sqlx::query(
            r#"
            UPDATE payout_withdrawal_challenges
            SET stage = $1
            WHERE user_id = $2 AND purpose = $3 AND stage = $4 AND challenge_id <> $5
            RETURNING challenge_id
            "#,
        )
        .bind(WithdrawalStage::Cancelled.name())
        .bind(&challenge.user_id)
        .bind(challenge.purpose.as_str())
        .bind(WithdrawalStage::OtpRequested.name())
        .bind(&challenge.challenge_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| backend("cancel open challenges", e))?;

        upsert_challenge(challenge)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("save challenge", e))?;
        tx.commit()
            .await
            .map_err(|e| backend("commit challenge replace", e))?;

        rows.iter().map(|row| column(row, "challenge_id")).collect()
    }

    async fn claim_passcode_attempt(
        &self,
        challenge_id: &str,
        max_attempts: u32,
    ) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE payout_withdrawal_challenges
            SET attempts = attempts + 1
            WHERE challenge_id = $1 AND stage = $2 AND attempts < $3
            RETURNING attempts
            "#,
        )
        .bind(challenge_id)
        .bind(WithdrawalStage::OtpRequested.name())
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("claim passcode attempt", e))?;

        row.map(|row| {
            let attempts: i32 = column(&row, "attempts")?;
            u32::try_from(attempts)
                .map_err(|_| StoreError::Backend(format!("negative attempts count {attempts}")))
        })
        .transpose()
    }

    async fn open_challenge(
        &self,
        user_id: &str,
        purpose: PasscodePurpose,
    ) -> Result<Option<WithdrawalChallenge>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM payout_withdrawal_challenges \
             WHERE user_id = $1 AND purpose = $2 AND stage = $3 \
             ORDER BY issued_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .bind(purpose.as_str())
        .bind(WithdrawalStage::OtpRequested.name())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("load open challenge", e))?;

        row.as_ref().map(challenge_from_row).transpose()
    }
}

#[async_trait]
impl JournalStore for PostgresStore {
    async fn load_journal(&self) -> Result<Vec<JournalEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                journal_index,
                entry_id,
                kind,
                subject_id,
                user_id,
                entry_timestamp,
                payload,
                previous_hash,
                entry_hash
            FROM payout_journal_entries
            ORDER BY journal_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("load journal", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let index: i64 = column(&row, "journal_index")?;
            let kind: String = column(&row, "kind")?;
            entries.push(JournalEntry {
                entry_id: column(&row, "entry_id")?,
                index: index.try_into().map_err(|_| {
                    StoreError::Backend("negative journal index in storage".to_string())
                })?,
                kind: JournalEntryKind::parse(&kind)
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
                subject_id: column(&row, "subject_id")?,
                user_id: column(&row, "user_id")?,
                timestamp: column(&row, "entry_timestamp")?,
                payload: column(&row, "payload")?,
                previous_hash: column(&row, "previous_hash")?,
                entry_hash: column(&row, "entry_hash")?,
            });
        }
        Ok(entries)
    }

    async fn append_journal_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let index: i64 = entry.index.try_into().map_err(|_| {
            StoreError::Backend("journal index exceeds postgres BIGINT range".to_string())
        })?;
        sqlx::query(
            r#"
            INSERT INTO payout_journal_entries (
                journal_index, entry_id, kind, subject_id, user_id,
                entry_timestamp, payload, previous_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(index)
        .bind(&entry.entry_id)
        .bind(entry.kind.as_str())
        .bind(&entry.subject_id)
        .bind(&entry.user_id)
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("insert journal entry", e))?;
        Ok(())
    }
}

async fn balance_inputs_on(
    conn: &mut sqlx::PgConnection,
    user_id: &str,
) -> Result<BalanceInputs, StoreError> {
    let sales = sqlx::query(
        r#"
        SELECT COALESCE(SUM(net_amount), 0)::BIGINT AS sales_net
        FROM payout_transactions
        WHERE user_id = $1 AND status IN ('approved', 'retained')
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| backend("sum transactions", e))?;

    let withdrawals = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(requested_amount) FILTER (WHERE status IN ('approved', 'completed')), 0)::BIGINT AS settled,
            COALESCE(SUM(requested_amount) FILTER (WHERE status = 'pending'), 0)::BIGINT AS pending
        FROM payout_withdrawals
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| backend("sum withdrawals", e))?;

    Ok(BalanceInputs {
        sales_net: Money::from_minor(column(&sales, "sales_net")?),
        settled_withdrawals: Money::from_minor(column(&withdrawals, "settled")?),
        pending_withdrawals: Money::from_minor(column(&withdrawals, "pending")?),
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let payment_method: String = column(row, "payment_method")?;
    let status: String = column(row, "status")?;
    let settlement_days: i32 = column(row, "settlement_days")?;
    let affiliate_bps: Option<i32> = column(row, "affiliate_commission_bps")?;

    let affiliate_commission_percent = affiliate_bps
        .map(|bps| {
            u32::try_from(bps)
                .ok()
                .and_then(|bps| Rate::from_bps(bps).ok())
                .ok_or_else(|| {
                    StoreError::Backend(format!("invalid affiliate_commission_bps {bps}"))
                })
        })
        .transpose()?;

    Ok(Transaction {
        id: column(row, "id")?,
        user_id: column(row, "user_id")?,
        gross_amount: Money::from_minor(column(row, "gross_amount")?),
        payment_method: parse_column("payment_method", &payment_method)?,
        settlement_days: u16::try_from(settlement_days).map_err(|_| {
            StoreError::Backend(format!("invalid settlement_days {settlement_days}"))
        })?,
        affiliate_commission_percent,
        status: parse_column::<TransactionStatus>("status", &status)?,
        fees: FeeFields {
            platform_fee: Money::from_minor(column(row, "platform_fee")?),
            acquirer_fee: Money::from_minor(column(row, "acquirer_fee")?),
            commission_amount: Money::from_minor(column(row, "commission_amount")?),
            net_amount: Money::from_minor(column(row, "net_amount")?),
        },
        created_at: column(row, "created_at")?,
        fees_corrected_at: column(row, "fees_corrected_at")?,
    })
}

fn withdrawal_from_row(row: &PgRow) -> Result<Withdrawal, StoreError> {
    let status: String = column(row, "status")?;
    Ok(Withdrawal {
        id: column(row, "id")?,
        user_id: column(row, "user_id")?,
        requested_amount: Money::from_minor(column(row, "requested_amount")?),
        fee: Money::from_minor(column(row, "fee")?),
        net_amount: Money::from_minor(column(row, "net_amount")?),
        bank_account_id: column(row, "bank_account_id")?,
        status: parse_column::<WithdrawalStatus>("status", &status)?,
        idempotency_key: column(row, "idempotency_key")?,
        created_at: column(row, "created_at")?,
    })
}

/// Upsert of a challenge row; stage, attempts and withdrawal id are the only
/// mutable columns.
fn upsert_challenge(
    challenge: &WithdrawalChallenge,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO payout_withdrawal_challenges (
            challenge_id, user_id, purpose, requested_amount, bank_account_id,
            stage, attempts, issued_at, expires_at, withdrawal_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (challenge_id) DO UPDATE SET
            stage = EXCLUDED.stage,
            attempts = GREATEST(payout_withdrawal_challenges.attempts, EXCLUDED.attempts),
            withdrawal_id = EXCLUDED.withdrawal_id
        "#,
    )
    .bind(&challenge.challenge_id)
    .bind(&challenge.user_id)
    .bind(challenge.purpose.as_str())
    .bind(challenge.requested_amount.minor())
    .bind(&challenge.bank_account_id)
    .bind(challenge.stage.name())
    .bind(i32::try_from(challenge.attempts).unwrap_or(i32::MAX))
    .bind(challenge.issued_at)
    .bind(challenge.expires_at)
    .bind(&challenge.withdrawal_id)
}

fn challenge_from_row(row: &PgRow) -> Result<WithdrawalChallenge, StoreError> {
    let purpose: String = column(row, "purpose")?;
    let stage: String = column(row, "stage")?;
    let attempts: i32 = column(row, "attempts")?;
    Ok(WithdrawalChallenge {
        challenge_id: column(row, "challenge_id")?,
        user_id: column(row, "user_id")?,
        purpose: parse_column::<PasscodePurpose>("purpose", &purpose)?,
        requested_amount: Money::from_minor(column(row, "requested_amount")?),
        bank_account_id: column(row, "bank_account_id")?,
        stage: WithdrawalStage::parse(&stage).map_err(|e| StoreError::Backend(e.to_string()))?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        issued_at: column(row, "issued_at")?,
        expires_at: column(row, "expires_at")?,
        withdrawal_id: column(row, "withdrawal_id")?,
    })
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Backend(format!("postgres decode {name} failed: {e}")))
}

fn parse_column<T>(name: &str, value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StoreError::Backend(format!("postgres column {name}: {e}")))
}

fn backend(operation: &str, error: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("postgres {operation} failed: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::PaymentMethod;

    #[test]
    fn stored_enum_strings_parse_back() {
        for status in [
            WithdrawalStatus::Pending,
            WithdrawalStatus::Approved,
            WithdrawalStatus::Completed,
            WithdrawalStatus::Rejected,
        ] {
            assert_eq!(
                parse_column::<WithdrawalStatus>("status", status.as_str()).unwrap(),
                status
            );
        }
        for method in [PaymentMethod::Pix, PaymentMethod::Boleto, PaymentMethod::CreditCard] {
            assert_eq!(
                parse_column::<PaymentMethod>("payment_method", method.as_str()).unwrap(),
                method
            );
        }
    }

    #[test]
    fn unknown_stored_values_surface_as_backend_errors() {
        let err = parse_column::<TransactionStatus>("status", "settled").unwrap_err();
        assert!(matches!(err, StoreError::Backend(message) if message.contains("status")));
    }
}
