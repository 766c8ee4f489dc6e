//! jnl-db
//!
//! Postgres persistence for executions, positions, and integrity issues.
//! Executions are append-only with supersede lineage; positions are derived
//! rows replaced atomically per (account, instrument) scope; issues are
//! append-only with write-once repair-outcome columns.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use jnl_schemas::{
    ExecutionRecord, IntegrityIssue, IssueKind, IssueScope, Position, PositionSide, RoleHint,
    Severity, Side,
};

pub const ENV_DB_URL: &str = "JNL_DATABASE_URL";

/// Connect to Postgres using JNL_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Enum <-> text mapping
// ---------------------------------------------------------------------------

fn side_to_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn side_from_str(s: &str) -> Result<Side> {
    match s {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => bail!("unknown side {other:?}"),
    }
}

fn hint_to_str(hint: RoleHint) -> &'static str {
    match hint {
        RoleHint::Entry => "ENTRY",
        RoleHint::Exit => "EXIT",
        RoleHint::Unknown => "UNKNOWN",
    }
}

fn hint_from_str(s: &str) -> Result<RoleHint> {
    match s {
        "ENTRY" => Ok(RoleHint::Entry),
        "EXIT" => Ok(RoleHint::Exit),
        "UNKNOWN" => Ok(RoleHint::Unknown),
        other => bail!("unknown role hint {other:?}"),
    }
}

fn position_side_to_str(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "LONG",
        PositionSide::Short => "SHORT",
    }
}

fn position_side_from_str(s: &str) -> Result<PositionSide> {
    match s {
        "LONG" => Ok(PositionSide::Long),
        "SHORT" => Ok(PositionSide::Short),
        other => bail!("unknown position side {other:?}"),
    }
}

fn kind_to_str(kind: IssueKind) -> &'static str {
    kind.as_str()
}

fn kind_from_str(s: &str) -> Result<IssueKind> {
    match s {
        "quantity_mismatch" => Ok(IssueKind::QuantityMismatch),
        "timestamp_anomaly" => Ok(IssueKind::TimestampAnomaly),
        "incomplete_data" => Ok(IssueKind::IncompleteData),
        other => bail!("unknown issue kind {other:?}"),
    }
}

fn severity_to_str(severity: Severity) -> &'static str {
    severity.as_str()
}

fn severity_from_str(s: &str) -> Result<Severity> {
    match s {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        other => bail!("unknown severity {other:?}"),
    }
}

fn uuids_to_json(ids: &[Uuid]) -> Result<Value> {
    serde_json::to_value(ids).context("serialize uuid list")
}

fn uuids_from_json(value: Value) -> Result<Vec<Uuid>> {
    serde_json::from_value(value).context("parse uuid list")
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Insert one execution record (append-only).
pub async fn insert_execution(pool: &PgPool, rec: &ExecutionRecord) -> Result<()> {
    sqlx::query(
        r#"
        insert into executions (
          id, account, instrument, side, role_hint, quantity, price_micros,
          ts_utc, commission_micros, source_seq, supersedes, voided
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(rec.id)
    .bind(&rec.account)
    .bind(&rec.instrument)
    .bind(rec.side.map(side_to_str))
    .bind(hint_to_str(rec.role_hint))
    .bind(rec.quantity)
    .bind(rec.price_micros)
    .bind(rec.ts_utc)
    .bind(rec.commission_micros)
    .bind(rec.source_seq.map(|s| s as i64))
    .bind(rec.supersedes)
    .bind(rec.voided)
    .execute(pool)
    .await
    .context("insert_execution failed")?;
    Ok(())
}

/// Fetch a scope's execution records ordered canonically (ts, id).
pub async fn fetch_executions(
    pool: &PgPool,
    account: &str,
    instrument: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<ExecutionRecord>> {
    let rows = sqlx::query(
        r#"
        select id, account, instrument, side, role_hint, quantity,
               price_micros, ts_utc, commission_micros, source_seq,
               supersedes, voided
        from executions
        where account = $1
          and instrument = $2
          and ($3::timestamptz is null or ts_utc >= $3)
        order by ts_utc, id
        "#,
    )
    .bind(account)
    .bind(instrument)
    .bind(since)
    .fetch_all(pool)
    .await
    .context("fetch_executions failed")?;

    rows.iter().map(row_to_execution).collect()
}

fn row_to_execution(row: &PgRow) -> Result<ExecutionRecord> {
    let side: Option<String> = row.try_get("side")?;
    let role_hint: String = row.try_get("role_hint")?;
    let source_seq: Option<i64> = row.try_get("source_seq")?;
    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        account: row.try_get("account")?,
        instrument: row.try_get("instrument")?,
        side: side.as_deref().map(side_from_str).transpose()?,
        role_hint: hint_from_str(&role_hint)?,
        quantity: row.try_get("quantity")?,
        price_micros: row.try_get("price_micros")?,
        ts_utc: row.try_get("ts_utc")?,
        commission_micros: row.try_get("commission_micros")?,
        source_seq: source_seq
            .map(|s| u64::try_from(s).context("negative source_seq"))
            .transpose()?,
        supersedes: row.try_get("supersedes")?,
        voided: row.try_get("voided")?,
    })
}

/// Apply a correction atomically: void the superseded originals and insert
/// their replacement records in one transaction.
pub async fn apply_correction(
    pool: &PgPool,
    voided_ids: &[Uuid],
    inserted: &[ExecutionRecord],
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin correction tx")?;

    for id in voided_ids {
        let res = sqlx::query("update executions set voided = true where id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("void execution failed")?;
        if res.rows_affected() == 0 {
            bail!("void target {id} not found");
        }
    }

    for rec in inserted {
        sqlx::query(
            r#"
            insert into executions (
              id, account, instrument, side, role_hint, quantity, price_micros,
              ts_utc, commission_micros, source_seq, supersedes, voided
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(rec.id)
        .bind(&rec.account)
        .bind(&rec.instrument)
        .bind(rec.side.map(side_to_str))
        .bind(hint_to_str(rec.role_hint))
        .bind(rec.quantity)
        .bind(rec.price_micros)
        .bind(rec.ts_utc)
        .bind(rec.commission_micros)
        .bind(rec.source_seq.map(|s| s as i64))
        .bind(rec.supersedes)
        .bind(rec.voided)
        .execute(&mut *tx)
        .await
        .context("insert superseding execution failed")?;
    }

    tx.commit().await.context("commit correction tx")?;
    Ok(())
}

/// Distinct (account, instrument) scopes present in the execution store.
pub async fn list_scopes(pool: &PgPool) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        "select distinct account, instrument from executions order by account, instrument",
    )
    .fetch_all(pool)
    .await
    .context("list_scopes failed")?;
    rows.iter()
        .map(|row| Ok((row.try_get("account")?, row.try_get("instrument")?)))
        .collect()
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Load a scope's derived position rows.
pub async fn load_positions(
    pool: &PgPool,
    account: &str,
    instrument: &str,
) -> Result<Vec<Position>> {
    let rows = sqlx::query(
        r#"
        select id, account, instrument, side, opened_at_utc, closed_at_utc,
               total_entry_qty, total_exit_qty, avg_entry_price_micros,
               avg_exit_price_micros, realized_pnl_micros,
               total_commission_micros, execution_ids, flagged
        from positions
        where account = $1 and instrument = $2
        order by opened_at_utc, id
        "#,
    )
    .bind(account)
    .bind(instrument)
    .fetch_all(pool)
    .await
    .context("load_positions failed")?;

    rows.iter().map(row_to_position).collect()
}

fn row_to_position(row: &PgRow) -> Result<Position> {
    let side: String = row.try_get("side")?;
    let execution_ids: Value = row.try_get("execution_ids")?;
    Ok(Position {
        id: row.try_get("id")?,
        account: row.try_get("account")?,
        instrument: row.try_get("instrument")?,
        side: position_side_from_str(&side)?,
        opened_at: row.try_get("opened_at_utc")?,
        closed_at: row.try_get("closed_at_utc")?,
        total_entry_qty: row.try_get("total_entry_qty")?,
        total_exit_qty: row.try_get("total_exit_qty")?,
        avg_entry_price_micros: row.try_get("avg_entry_price_micros")?,
        avg_exit_price_micros: row.try_get("avg_exit_price_micros")?,
        realized_pnl_micros: row.try_get("realized_pnl_micros")?,
        total_commission_micros: row.try_get("total_commission_micros")?,
        execution_ids: uuids_from_json(execution_ids)?,
        flagged: row.try_get("flagged")?,
    })
}

/// Replace a scope's position rows atomically: delete-then-insert inside one
/// transaction, so readers never observe a half-rebuilt scope.
pub async fn replace_positions(
    pool: &PgPool,
    account: &str,
    instrument: &str,
    positions: &[Position],
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin replace_positions tx")?;

    sqlx::query("delete from positions where account = $1 and instrument = $2")
        .bind(account)
        .bind(instrument)
        .execute(&mut *tx)
        .await
        .context("delete scope positions failed")?;

    for pos in positions {
        sqlx::query(
            r#"
            insert into positions (
              id, account, instrument, side, opened_at_utc, closed_at_utc,
              total_entry_qty, total_exit_qty, avg_entry_price_micros,
              avg_exit_price_micros, realized_pnl_micros,
              total_commission_micros, execution_ids, flagged
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(pos.id)
        .bind(&pos.account)
        .bind(&pos.instrument)
        .bind(position_side_to_str(pos.side))
        .bind(pos.opened_at)
        .bind(pos.closed_at)
        .bind(pos.total_entry_qty)
        .bind(pos.total_exit_qty)
        .bind(pos.avg_entry_price_micros)
        .bind(pos.avg_exit_price_micros)
        .bind(pos.realized_pnl_micros)
        .bind(pos.total_commission_micros)
        .bind(uuids_to_json(&pos.execution_ids)?)
        .bind(pos.flagged)
        .execute(&mut *tx)
        .await
        .context("insert position failed")?;
    }

    tx.commit().await.context("commit replace_positions tx")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Integrity issues
// ---------------------------------------------------------------------------

/// Insert a new issue record (append-only).
pub async fn insert_issue(pool: &PgPool, issue: &IntegrityIssue) -> Result<()> {
    sqlx::query(
        r#"
        insert into integrity_issues (
          id, kind, severity, account, instrument, position_ids,
          execution_ids, detail, detected_at_utc, repair_attempted,
          repair_method, repair_successful, repair_details
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(issue.id)
    .bind(kind_to_str(issue.kind))
    .bind(severity_to_str(issue.severity))
    .bind(&issue.scope.account)
    .bind(&issue.scope.instrument)
    .bind(uuids_to_json(&issue.scope.position_ids)?)
    .bind(uuids_to_json(&issue.scope.execution_ids)?)
    .bind(&issue.detail)
    .bind(issue.detected_at)
    .bind(issue.repair_attempted)
    .bind(issue.repair_method.as_deref())
    .bind(issue.repair_successful)
    .bind(issue.repair_details.as_deref())
    .execute(pool)
    .await
    .context("insert_issue failed")?;
    Ok(())
}

/// Record a repair outcome on an issue. Write-once: refuses to overwrite an
/// issue that already has an attempt recorded; re-detection must file a new
/// issue instead.
pub async fn archive_issue_repair(
    pool: &PgPool,
    issue_id: Uuid,
    method: &str,
    successful: bool,
    details: &str,
) -> Result<()> {
    let res = sqlx::query(
        r#"
        update integrity_issues
        set repair_attempted = true,
            repair_method = $2,
            repair_successful = $3,
            repair_details = $4
        where id = $1 and repair_attempted = false
        "#,
    )
    .bind(issue_id)
    .bind(method)
    .bind(successful)
    .bind(details)
    .execute(pool)
    .await
    .context("archive_issue_repair failed")?;
    if res.rows_affected() == 0 {
        bail!("issue {issue_id} not found or repair already recorded");
    }
    Ok(())
}

/// Issues for a scope with no repair attempt yet, most severe first.
pub async fn list_open_issues(
    pool: &PgPool,
    account: &str,
    instrument: &str,
) -> Result<Vec<IntegrityIssue>> {
    let rows = sqlx::query(
        r#"
        select id, kind, severity, account, instrument, position_ids,
               execution_ids, detail, detected_at_utc, repair_attempted,
               repair_method, repair_successful, repair_details
        from integrity_issues
        where account = $1 and instrument = $2 and repair_attempted = false
        order by detected_at_utc, id
        "#,
    )
    .bind(account)
    .bind(instrument)
    .fetch_all(pool)
    .await
    .context("list_open_issues failed")?;

    rows.iter().map(row_to_issue).collect()
}

fn row_to_issue(row: &PgRow) -> Result<IntegrityIssue> {
    let kind: String = row.try_get("kind")?;
    let severity: String = row.try_get("severity")?;
    let position_ids: Value = row.try_get("position_ids")?;
    let execution_ids: Value = row.try_get("execution_ids")?;
    Ok(IntegrityIssue {
        id: row.try_get("id")?,
        kind: kind_from_str(&kind)?,
        severity: severity_from_str(&severity)?,
        scope: IssueScope {
            account: row.try_get("account")?,
            instrument: row.try_get("instrument")?,
            position_ids: uuids_from_json(position_ids)?,
            execution_ids: uuids_from_json(execution_ids)?,
        },
        detail: row.try_get("detail")?,
        detected_at: row.try_get("detected_at_utc")?,
        repair_attempted: row.try_get("repair_attempted")?,
        repair_method: row.try_get("repair_method")?,
        repair_successful: row.try_get("repair_successful")?,
        repair_details: row.try_get("repair_details")?,
    })
}

// ---------------------------------------------------------------------------
// Tests (pure mapping only; live-DB coverage belongs to scenario suites)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_roundtrip() {
        for side in [Side::Buy, Side::Sell] {
            assert_eq!(side_from_str(side_to_str(side)).unwrap(), side);
        }
        assert!(side_from_str("HOLD").is_err());
    }

    #[test]
    fn hint_roundtrip() {
        for hint in [RoleHint::Entry, RoleHint::Exit, RoleHint::Unknown] {
            assert_eq!(hint_from_str(hint_to_str(hint)).unwrap(), hint);
        }
    }

    #[test]
    fn position_side_roundtrip() {
        for side in [PositionSide::Long, PositionSide::Short] {
            assert_eq!(
                position_side_from_str(position_side_to_str(side)).unwrap(),
                side
            );
        }
    }

    #[test]
    fn kind_and_severity_roundtrip() {
        for kind in [
            IssueKind::QuantityMismatch,
            IssueKind::TimestampAnomaly,
            IssueKind::IncompleteData,
        ] {
            assert_eq!(kind_from_str(kind_to_str(kind)).unwrap(), kind);
        }
        for severity in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            assert_eq!(
                severity_from_str(severity_to_str(severity)).unwrap(),
                severity
            );
        }
    }

    #[test]
    fn uuid_list_json_roundtrip() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let value = uuids_to_json(&ids).unwrap();
        assert_eq!(uuids_from_json(value).unwrap(), ids);
    }
}
