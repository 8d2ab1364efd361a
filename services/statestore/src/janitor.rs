//! Background TTL janitor.
//!
//! Periodically deletes expired rows from provisioned targets. Each tick
//! sweeps exactly one target (the least recently swept, per the registry's
//! `last_expired_at`), which bounds per-tick work and keeps sweeping fair
//! across tenants. Sweep failures are logged and retried on a later tick;
//! readers never see expired rows regardless because reads filter on
//! `expires_at`.

use crate::routing::Target;
use crate::store::StoreError;
use crate::store::postgres::classify_sqlx;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Run the sweep loop until the shutdown channel flips.
///
/// The ticker delays missed ticks rather than bursting, so a slow sweep is
/// never run re-entrantly. An in-flight sweep finishes before the task
/// exits; the caller closes the pool only after joining this task.
pub async fn run(pool: PgPool, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(period_secs = period.as_secs(), "ttl janitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sweep_next(&pool).await {
                    tracing::warn!(error = %err, "ttl sweep failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("ttl janitor stopped");
}

/// Sweep the least-recently-swept registered target, then stamp it.
async fn sweep_next(pool: &PgPool) -> Result<(), StoreError> {
    let Some((tenant_id, schema_id, table_id)) = sqlx::query_as::<_, (String, String, String)>(
        "SELECT tenant_id, schema_id, table_id FROM pluggable_metadata.tenant \
         ORDER BY last_expired_at ASC NULLS FIRST LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(classify_sqlx)?
    else {
        return Ok(());
    };

    let target = Target {
        schema: schema_id,
        table: table_id,
    };
    let sql = format!(
        "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at < now()",
        target.qualified()
    );
    match sqlx::query(&sql).execute(pool).await.map_err(classify_sqlx) {
        Ok(done) => {
            if done.rows_affected() > 0 {
                tracing::debug!(
                    tenant = %tenant_id,
                    target = %target.qualified(),
                    rows = done.rows_affected(),
                    "expired rows deleted"
                );
            }
        }
        // The registry can outlive a dropped table; skip and stamp so the
        // sweep rotation keeps moving.
        Err(StoreError::TableMissing) => {}
        Err(err) => return Err(err),
    }

    sqlx::query(
        "UPDATE pluggable_metadata.tenant SET last_expired_at = now() \
         WHERE schema_id = $1 AND table_id = $2",
    )
    .bind(&target.schema)
    .bind(&target.table)
    .execute(pool)
    .await
    .map_err(classify_sqlx)?;
    Ok(())
}
