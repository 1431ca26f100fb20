//! Relational metadata index (Postgres via sqlx).
//!
//! The index is the only cross-run state: the freshness gate and the
//! recurrence input to the noise score read it, and every persisted run
//! upserts into it. All writes are per-run and idempotent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::model::Investigation;

pub struct Index {
    pool: PgPool,
}

/* ============================= SCHEMA ============================= */

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS cases (
        case_id TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        latest_one_liner TEXT,
        latest_run_id TEXT,
        team TEXT,
        family TEXT NOT NULL,
        severity TEXT,
        classification TEXT NOT NULL,
        impact SMALLINT NOT NULL,
        confidence SMALLINT NOT NULL,
        noise SMALLINT NOT NULL,
        resolution_category TEXT,
        resolution_summary TEXT,
        postmortem_link TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL REFERENCES cases(case_id),
        created_at TIMESTAMPTZ NOT NULL,
        report_key TEXT NOT NULL,
        analysis_json JSONB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS chat_threads (
        thread_id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL REFERENCES cases(case_id),
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS chat_messages (
        message_id TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL REFERENCES chat_threads(thread_id),
        created_at TIMESTAMPTZ NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS case_actions (
        action_id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL REFERENCES cases(case_id),
        created_at TIMESTAMPTZ NOT NULL,
        kind TEXT NOT NULL,
        detail TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS runs_case_created ON runs(case_id, created_at DESC)",
];

impl Index {
    pub async fn connect(database_url: &str) -> Result<Index> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("Failed to connect to the metadata index")?;
        Ok(Index { pool })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("apply index schema")?;
        }
        info!("index_schema_ready");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert the case row and insert the run row in one transaction.
    pub async fn upsert_investigation(
        &self,
        investigation: &Investigation,
        report_key: &str,
    ) -> Result<()> {
        let scores = &investigation.analysis.scores;
        let mut tx = self.pool.begin().await.context("begin index transaction")?;

        sqlx::query(
            r#"INSERT INTO cases
                (case_id, created_at, status, latest_one_liner, latest_run_id,
                 team, family, severity, classification, impact, confidence, noise)
               VALUES ($1, $2, 'open', $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (case_id) DO UPDATE SET
                 latest_one_liner = EXCLUDED.latest_one_liner,
                 latest_run_id = EXCLUDED.latest_run_id,
                 classification = EXCLUDED.classification,
                 impact = EXCLUDED.impact,
                 confidence = EXCLUDED.confidence,
                 noise = EXCLUDED.noise,
                 severity = EXCLUDED.severity"#,
        )
        .bind(&investigation.case_id)
        .bind(investigation.created_at)
        .bind(&investigation.analysis.decision.label)
        .bind(&investigation.run_id)
        .bind(investigation.alert.team())
        .bind(investigation.family.as_str())
        .bind(investigation.alert.severity())
        .bind(scores.classification.as_str())
        .bind(scores.impact as i16)
        .bind(scores.confidence as i16)
        .bind(scores.noise as i16)
        .execute(&mut *tx)
        .await
        .context("upsert case")?;

        sqlx::query(
            r#"INSERT INTO runs (run_id, case_id, created_at, report_key, analysis_json)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (run_id) DO NOTHING"#,
        )
        .bind(&investigation.run_id)
        .bind(&investigation.case_id)
        .bind(investigation.created_at)
        .bind(report_key)
        .bind(serde_json::to_value(&investigation.analysis).context("serialize analysis")?)
        .execute(&mut *tx)
        .await
        .context("insert run")?;

        tx.commit().await.context("commit index transaction")?;
        Ok(())
    }

    /// Most recent run time for a case; the freshness gate keys on this.
    pub async fn last_run_at(&self, case_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT created_at FROM runs WHERE case_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await
        .context("query last run")?;
        Ok(row.map(|r| r.get::<DateTime<Utc>, _>("created_at")))
    }

    /// Runs for this case in the trailing 24 hours; feeds the noise score.
    pub async fn recurrence_24h(&self, case_id: &str) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM runs WHERE case_id = $1 AND created_at > now() - interval '24 hours'",
        )
        .bind(case_id)
        .fetch_one(&self.pool)
        .await
        .context("query recurrence")?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    /// Latest report key for a case, used when the freshness gate marks an
    /// artifact for overwrite.
    pub async fn latest_report_key(&self, case_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT report_key FROM runs WHERE case_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await
        .context("query latest report key")?;
        Ok(row.map(|r| r.get::<String, _>("report_key")))
    }
}
