//! The canonical adapter: a PostgreSQL-style engine driven over
//! `tokio_postgres`, using `COPY FROM STDIN` as the native bulk path.
//!
//! Every identifier that reaches a SQL string here is first passed
//! through `eurostat_core::naming`'s quoting helpers; dataset and
//! codelist ids are treated as opaque, untrusted strings (§9).

use std::fmt::Write as _;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::Utc;
use eurostat_core::error::{PipelineError, Result};
use eurostat_core::model::{
    CodelistMap, Dsd, FinalizeStrategy, IngestionHistory, IngestionStatus, LoadStrategy,
    Observation, Representation,
};
use eurostat_core::naming::{quote_ident, quote_qualified};
use futures::SinkExt;
use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::{naming_sweep, Loader, ObservationStream};

const HISTORY_TABLE: &str = "_ingestion_history";

/// Adapter holding a single live connection, matching the pipeline's
/// one-connection-per-loader-instance concurrency model (§5).
pub struct PostgresLoader {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PostgresLoader {
    /// Connect using a libpq-style connection string. The connection's
    /// background driver task is spawned immediately; errors on it are
    /// logged, not propagated (a dead connection surfaces to the caller
    /// as a failure on the next query instead).
    pub async fn connect(conn_str: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection task exited with error");
            }
        });
        Ok(PostgresLoader {
            client,
            connection_task,
        })
    }

    async fn ensure_schema(&self, schema: &str) -> Result<()> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| db_err("prepare_schema", schema, e))?;
        Ok(())
    }

    async fn existing_columns(&self, schema: &str, table: &str) -> Result<Vec<(String, String)>> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2",
                &[&schema, &table],
            )
            .await
            .map_err(|e| db_err("prepare_schema", table, e))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect())
    }
}

/// Column layout derived from a DSD per the data model's schema
/// layout: one string column per non-time dimension, `time_period`,
/// nullable `obs_value` (double precision), nullable `obs_flags`.
fn data_columns(dsd: &Dsd) -> Vec<(String, &'static str)> {
    let mut cols: Vec<(String, &'static str)> = dsd
        .non_time_dimension_ids()
        .into_iter()
        .map(|id| (id.to_string(), "text"))
        .collect();
    cols.push(("time_period".to_string(), "text"));
    cols.push(("obs_value".to_string(), "double precision"));
    cols.push(("obs_flags".to_string(), "text"));
    cols
}

fn primary_key_columns(dsd: &Dsd) -> Vec<String> {
    let mut pk: Vec<String> = dsd.non_time_dimension_ids().into_iter().map(String::from).collect();
    pk.push("time_period".to_string());
    pk
}

fn db_err(op: &str, table: &str, e: tokio_postgres::Error) -> PipelineError {
    PipelineError::Other(anyhow::anyhow!("postgres {op} on {table} failed: {e}"))
}

#[async_trait]
impl Loader for PostgresLoader {
    async fn prepare_schema(
        &mut self,
        dsd: &Dsd,
        table: &str,
        schema: &str,
        last_ingestion: Option<&IngestionHistory>,
    ) -> Result<()> {
        if let Some(last) = last_ingestion {
            if last.dsd_version == dsd.version() {
                let existing = self.existing_columns(schema, table).await?;
                if !existing.is_empty() {
                    info!(table, version = dsd.version(), "schema already at current dsd version");
                    return Ok(());
                }
            }
        }

        self.ensure_schema(schema).await?;

        let qualified = quote_qualified(schema, table);
        let existing = self.existing_columns(schema, table).await?;
        let wanted = data_columns(dsd);

        if existing.is_empty() {
            let pk = primary_key_columns(dsd)
                .into_iter()
                .map(|c| quote_ident(&c))
                .collect::<Vec<_>>()
                .join(", ");
            let mut sql = format!("CREATE TABLE {qualified} (");
            for (name, ty) in &wanted {
                let _ = write!(sql, "{} {}, ", quote_ident(name), ty);
            }
            let _ = write!(sql, "PRIMARY KEY ({pk}))");
            self.client
                .batch_execute(&sql)
                .await
                .map_err(|e| db_err("prepare_schema", table, e))?;
            return Ok(());
        }

        for (name, ty) in &wanted {
            match existing.iter().find(|(ex_name, _)| ex_name == name) {
                None => {
                    let sql = format!(
                        "ALTER TABLE {qualified} ADD COLUMN {} {}",
                        quote_ident(name),
                        ty
                    );
                    self.client
                        .batch_execute(&sql)
                        .await
                        .map_err(|e| db_err("prepare_schema", table, e))?;
                }
                Some((_, existing_ty)) => {
                    let compatible = existing_ty.contains(ty) || ty.contains(existing_ty.as_str());
                    if !compatible {
                        return Err(PipelineError::SchemaEvolutionConflict {
                            table: table.to_string(),
                            column: name.clone(),
                            existing: existing_ty.clone(),
                            wanted: ty.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn manage_codelists(&mut self, codelists: &CodelistMap, schema: &str) -> Result<()> {
        self.ensure_schema(schema).await?;

        for (id, codelist) in codelists {
            let table = eurostat_core::naming::codelist_table_name(id);
            let qualified = quote_qualified(schema, &table);
            let create = format!(
                "CREATE TABLE IF NOT EXISTS {qualified} (\
                 code text PRIMARY KEY, label text NOT NULL, description text, parent_code text)"
            );
            self.client
                .batch_execute(&create)
                .await
                .map_err(|e| db_err("manage_codelists", &table, e))?;

            let staging_table = format!("{table}_stg");
            let create_staging = format!(
                "CREATE TEMP TABLE {} (LIKE {qualified} INCLUDING DEFAULTS) ON COMMIT DROP",
                quote_ident(&staging_table)
            );

            let txn = self
                .client
                .transaction()
                .await
                .map_err(|e| db_err("manage_codelists", &table, e))?;
            txn.batch_execute(&create_staging)
                .await
                .map_err(|e| db_err("manage_codelists", &table, e))?;

            let copy_sql = format!(
                "COPY {} (code, label, description, parent_code) FROM STDIN WITH (FORMAT csv, DELIMITER E'\\t', NULL '')",
                quote_ident(&staging_table)
            );
            let sink = txn
                .copy_in(&copy_sql)
                .await
                .map_err(|e| PipelineError::BulkLoadFailed {
                    staging: staging_table.clone(),
                    reason: e.to_string(),
                })?;
            futures::pin_mut!(sink);
            for (code, entry) in codelist.iter() {
                let mut line = BytesMut::new();
                write_csv_field(&mut line, code);
                line.put_u8(b'\t');
                write_csv_field(&mut line, &entry.label);
                line.put_u8(b'\t');
                write_csv_field(&mut line, entry.description.as_deref().unwrap_or(""));
                line.put_u8(b'\t');
                write_csv_field(&mut line, entry.parent_code.as_deref().unwrap_or(""));
                line.put_u8(b'\n');
                sink.send(line.freeze())
                    .await
                    .map_err(|e| PipelineError::BulkLoadFailed {
                        staging: staging_table.clone(),
                        reason: e.to_string(),
                    })?;
            }
            sink.finish().await.map_err(|e| PipelineError::BulkLoadFailed {
                staging: staging_table.clone(),
                reason: e.to_string(),
            })?;

            let merge = format!(
                "INSERT INTO {qualified} (code, label, description, parent_code) \
                 SELECT code, label, description, parent_code FROM {} \
                 ON CONFLICT (code) DO UPDATE SET label = EXCLUDED.label, \
                 description = EXCLUDED.description, parent_code = EXCLUDED.parent_code",
                quote_ident(&staging_table)
            );
            txn.batch_execute(&merge)
                .await
                .map_err(|e| db_err("manage_codelists", &table, e))?;
            txn.commit().await.map_err(|e| db_err("manage_codelists", &table, e))?;
        }
        Ok(())
    }

    async fn bulk_load_staging(
        &mut self,
        table: &str,
        schema: &str,
        mut observations: ObservationStream,
        use_unlogged: bool,
    ) -> Result<(String, i64)> {
        use futures::StreamExt;

        let run_id = naming_sweep::new_run_id(Utc::now().timestamp(), &uuid::Uuid::new_v4().simple().to_string());
        let staging_name = naming_sweep::staging_name(table, &run_id);
        let qualified_staging = quote_qualified(schema, &staging_name);
        let qualified_target = quote_qualified(schema, table);

        let unlogged = if use_unlogged { "UNLOGGED " } else { "" };
        let create = format!(
            "CREATE {unlogged}TABLE {qualified_staging} (LIKE {qualified_target} INCLUDING DEFAULTS EXCLUDING CONSTRAINTS)"
        );
        self.client
            .batch_execute(&create)
            .await
            .map_err(|e| PipelineError::BulkLoadFailed {
                staging: staging_name.clone(),
                reason: e.to_string(),
            })?;

        let copy_sql = format!(
            "COPY {qualified_staging} FROM STDIN WITH (FORMAT csv, DELIMITER E'\\t', NULL '')"
        );
        let sink = self
            .client
            .copy_in(&copy_sql)
            .await
            .map_err(|e| PipelineError::BulkLoadFailed {
                staging: staging_name.clone(),
                reason: e.to_string(),
            })?;
        futures::pin_mut!(sink);

        let mut count: i64 = 0;
        while let Some(obs) = observations.next().await {
            let line = encode_observation_row(&obs);
            sink.send(line)
                .await
                .map_err(|e| PipelineError::BulkLoadFailed {
                    staging: staging_name.clone(),
                    reason: e.to_string(),
                })?;
            count += 1;
        }
        sink.finish().await.map_err(|e| PipelineError::BulkLoadFailed {
            staging: staging_name.clone(),
            reason: e.to_string(),
        })?;

        Ok((staging_name, count))
    }

    async fn finalize_load(
        &mut self,
        staging: &str,
        target: &str,
        schema: &str,
        strategy: FinalizeStrategy,
    ) -> Result<()> {
        let txn = self
            .client
            .transaction()
            .await
            .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;

        match strategy {
            FinalizeStrategy::Swap => {
                let backup = format!("{target}__backup");
                let exists: bool = txn
                    .query_opt(
                        "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2",
                        &[&schema, &target],
                    )
                    .await
                    .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?
                    .is_some();

                if exists {
                    let rename_old = format!(
                        "ALTER TABLE {} RENAME TO {}",
                        quote_qualified(schema, target),
                        quote_ident(&backup)
                    );
                    txn.batch_execute(&rename_old)
                        .await
                        .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;
                }

                let rename_new = format!(
                    "ALTER TABLE {} RENAME TO {}",
                    quote_qualified(schema, staging),
                    quote_ident(target)
                );
                txn.batch_execute(&rename_new)
                    .await
                    .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;

                if exists {
                    let drop_backup = format!("DROP TABLE {}", quote_qualified(schema, &backup));
                    txn.batch_execute(&drop_backup)
                        .await
                        .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;
                }

                // The staging table was created EXCLUDING CONSTRAINTS, so the
                // swapped-in target has lost its primary key. Re-add it here,
                // inside the same transaction, before anything else can see
                // the table under its final name.
                let columns_rows = txn
                    .query(
                        "SELECT column_name FROM information_schema.columns \
                         WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                        &[&schema, &target],
                    )
                    .await
                    .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;
                let pk_cols: Vec<String> = columns_rows
                    .into_iter()
                    .map(|r| r.get::<_, String>(0))
                    .filter(|c| c != "obs_value" && c != "obs_flags")
                    .collect();
                if !pk_cols.is_empty() {
                    let pk_list = pk_cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
                    let constraint_name = quote_ident(&format!("{target}_pkey"));
                    let add_pk = format!(
                        "ALTER TABLE {} ADD CONSTRAINT {constraint_name} PRIMARY KEY ({pk_list})",
                        quote_qualified(schema, target)
                    );
                    txn.batch_execute(&add_pk)
                        .await
                        .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;
                }
            }
            FinalizeStrategy::Merge => {
                let columns_rows = txn
                    .query(
                        "SELECT column_name FROM information_schema.columns \
                         WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                        &[&schema, &staging],
                    )
                    .await
                    .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;
                let columns: Vec<String> = columns_rows.into_iter().map(|r| r.get(0)).collect();
                if columns.is_empty() {
                    return Err(finalize_err(
                        staging,
                        target,
                        strategy,
                        "staging table has no columns".to_string(),
                    ));
                }

                let col_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
                let pk_cols: Vec<&String> = columns
                    .iter()
                    .filter(|c| c.as_str() != "obs_value" && c.as_str() != "obs_flags")
                    .collect();
                let pk_list = pk_cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");

                let merge = format!(
                    "INSERT INTO {} ({col_list}) SELECT {col_list} FROM {} \
                     ON CONFLICT ({pk_list}) DO UPDATE SET obs_value = EXCLUDED.obs_value, obs_flags = EXCLUDED.obs_flags",
                    quote_qualified(schema, target),
                    quote_qualified(schema, staging)
                );
                txn.batch_execute(&merge)
                    .await
                    .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;

                let drop_staging = format!("DROP TABLE {}", quote_qualified(schema, staging));
                txn.batch_execute(&drop_staging)
                    .await
                    .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;
            }
        }

        txn.commit()
            .await
            .map_err(|e| finalize_err(staging, target, strategy, e.to_string()))?;
        Ok(())
    }

    async fn get_ingestion_state(
        &mut self,
        dataset_id: &str,
        schema: &str,
    ) -> Result<Option<IngestionHistory>> {
        self.ensure_schema(schema).await?;
        let qualified = quote_qualified(schema, HISTORY_TABLE);
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {qualified} (\
             ingestion_id bigint PRIMARY KEY, dataset_id text NOT NULL, dsd_version text NOT NULL, \
             load_strategy text NOT NULL, representation text NOT NULL, status text NOT NULL, \
             start_time timestamptz NOT NULL, end_time timestamptz, rows_loaded bigint, \
             source_last_update timestamptz, error_details text)"
        );
        self.client
            .batch_execute(&create)
            .await
            .map_err(|e| db_err("get_ingestion_state", HISTORY_TABLE, e))?;

        let row = self
            .client
            .query_opt(
                &format!(
                    "SELECT ingestion_id, dataset_id, dsd_version, load_strategy, representation, \
                     status, start_time, end_time, rows_loaded, source_last_update, error_details \
                     FROM {qualified} WHERE dataset_id = $1 AND status = 'success' \
                     ORDER BY ingestion_id DESC LIMIT 1"
                ),
                &[&dataset_id],
            )
            .await
            .map_err(|e| db_err("get_ingestion_state", HISTORY_TABLE, e))?;

        Ok(row.map(row_to_ingestion_history))
    }

    async fn save_ingestion_state(&mut self, record: &IngestionHistory, schema: &str) -> Result<()> {
        record.validate()?;
        self.ensure_schema(schema).await?;
        let qualified = quote_qualified(schema, HISTORY_TABLE);
        let sql = format!(
            "INSERT INTO {qualified} (ingestion_id, dataset_id, dsd_version, load_strategy, \
             representation, status, start_time, end_time, rows_loaded, source_last_update, error_details) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)"
        );
        self.client
            .execute(
                &sql,
                &[
                    &record.ingestion_id,
                    &record.dataset_id,
                    &record.dsd_version,
                    &load_strategy_str(record.load_strategy),
                    &representation_str(record.representation),
                    &status_str(record.status),
                    &record.start_time,
                    &record.end_time,
                    &record.rows_loaded,
                    &record.source_last_update,
                    &record.error_details,
                ],
            )
            .await
            .map_err(|e| PipelineError::IngestionHistoryWriteFailed {
                dataset_id: record.dataset_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn sweep_staging_tables(&mut self, schema: &str, older_than_seconds: i64) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name LIKE '%\\_\\_staging\\_%'",
                &[&schema],
            )
            .await
            .map_err(|e| db_err("sweep_staging_tables", schema, e))?;

        let mut reaped = Vec::new();
        for row in rows {
            let name: String = row.get(0);
            if naming_sweep::extract_epoch(&name)
                .map(|epoch| epoch < older_than_seconds)
                .unwrap_or(false)
            {
                let sql = format!("DROP TABLE IF EXISTS {}", quote_qualified(schema, &name));
                self.client
                    .batch_execute(&sql)
                    .await
                    .map_err(|e| db_err("sweep_staging_tables", &name, e))?;
                reaped.push(name);
            }
        }
        Ok(reaped)
    }

    async fn close_connection(&mut self) -> Result<()> {
        self.connection_task.abort();
        Ok(())
    }
}

fn finalize_err(staging: &str, target: &str, strategy: FinalizeStrategy, reason: String) -> PipelineError {
    PipelineError::FinalizeFailed {
        staging: staging.to_string(),
        target: target.to_string(),
        strategy: format!("{strategy:?}"),
        reason,
    }
}

fn load_strategy_str(s: LoadStrategy) -> &'static str {
    match s {
        LoadStrategy::Full => "full",
        LoadStrategy::Delta => "delta",
    }
}

fn representation_str(r: Representation) -> &'static str {
    match r {
        Representation::Standard => "standard",
        Representation::Full => "full",
    }
}

fn status_str(s: IngestionStatus) -> &'static str {
    match s {
        IngestionStatus::Running => "running",
        IngestionStatus::Success => "success",
        IngestionStatus::Failed => "failed",
        IngestionStatus::Skipped => "skipped",
    }
}

fn row_to_ingestion_history(row: tokio_postgres::Row) -> IngestionHistory {
    let load_strategy = match row.get::<_, String>(3).as_str() {
        "delta" => LoadStrategy::Delta,
        _ => LoadStrategy::Full,
    };
    let representation = match row.get::<_, String>(4).as_str() {
        "full" => Representation::Full,
        _ => Representation::Standard,
    };
    let status = match row.get::<_, String>(5).as_str() {
        "success" => IngestionStatus::Success,
        "failed" => IngestionStatus::Failed,
        "skipped" => IngestionStatus::Skipped,
        _ => IngestionStatus::Running,
    };
    IngestionHistory {
        ingestion_id: row.get(0),
        dataset_id: row.get(1),
        dsd_version: row.get(2),
        load_strategy,
        representation,
        status,
        start_time: row.get(6),
        end_time: row.get(7),
        rows_loaded: row.get(8),
        source_last_update: row.get(9),
        error_details: row.get(10),
    }
}

/// Encode one `Observation` as a tab-separated CSV COPY row, in the
/// adapter's fixed column order: non-time dimensions (DSD order),
/// `time_period`, `obs_value`, `obs_flags`.
fn encode_observation_row(obs: &Observation) -> bytes::Bytes {
    let mut buf = BytesMut::new();
    for (_, value) in &obs.dimensions {
        write_csv_field(&mut buf, value);
        buf.put_u8(b'\t');
    }
    write_csv_field(&mut buf, &obs.time_period);
    buf.put_u8(b'\t');
    match obs.obs_value {
        Some(v) => write_csv_field(&mut buf, &v.to_string()),
        None => {}
    }
    buf.put_u8(b'\t');
    if let Some(flags) = &obs.obs_flags {
        write_csv_field(&mut buf, flags);
    }
    buf.put_u8(b'\n');
    buf.freeze()
}

fn write_csv_field(buf: &mut BytesMut, field: &str) {
    if field.contains(['"', '\t', '\n']) {
        buf.put_u8(b'"');
        buf.extend_from_slice(field.replace('"', "\"\"").as_bytes());
        buf.put_u8(b'"');
    } else {
        buf.extend_from_slice(field.as_bytes());
    }
}
