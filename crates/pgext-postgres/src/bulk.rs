//! Bulk loading over the binary copy protocol.
//!
//! [`BulkLoader`] resolves an entity's column list from the schema registry,
//! coerces enumeration values to their stored integers and streams the
//! records through one `COPY ... FROM STDIN (FORMAT BINARY)` per call.
//!
//! # Example
//!
//! ```rust,ignore
//! use pgext_postgres::{BulkConfig, BulkLoader, ConnectConfig, Connection};
//!
//! let conn = Connection::new(&uri, ConnectConfig::default())?;
//! let loader = BulkLoader::new(conn, BulkConfig::default());
//!
//! // One physical connection, one copy stream
//! let result = loader.load(&users).await?;
//!
//! // Or join a transaction the caller already holds
//! let mut tx = pool.begin().await?;
//! loader.load_with(&mut tx, &users).await?;
//! tx.commit().await?;
//! ```

use sqlx::postgres::PgConnection;
use sqlx::Connection as _;
use std::any::type_name;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::copy::{BinaryCopyEncoder, CopySink};
use crate::schema::{ColumnDescriptor, ColumnKind, EntitySchema, SchemaRegistry};
use crate::types::{ExtractedValue, PgType};
use crate::validation::quote_identifier;
use crate::{Connection, PgExtError, Result};

/// Configuration for bulk loads.
#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// Leave primary key columns out of the copy so the column default
    /// generates them (default: true)
    pub server_generated_key: bool,
    /// Encoded bytes buffered before a chunk is sent (default: 64 KiB)
    pub send_buffer_size: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            server_generated_key: true,
            send_buffer_size: 64 * 1024,
        }
    }
}

impl BulkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_generated_key(mut self, generated: bool) -> Self {
        self.server_generated_key = generated;
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size.max(1);
        self
    }
}

/// Result of a bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkResult {
    /// Rows the server reported as copied
    pub rows_copied: u64,
    pub elapsed_ms: u64,
}

/// One load: the records, the resolved columns and the copy statement.
///
/// Built right before a load and consumed by it.
pub struct LoadRequest<'a, T> {
    table: String,
    records: &'a [T],
    server_generated_key: bool,
    columns: Vec<ColumnDescriptor<T>>,
    statement: String,
}

impl<'a, T> LoadRequest<'a, T> {
    pub fn new(
        schema: &EntitySchema<T>,
        records: &'a [T],
        server_generated_key: bool,
    ) -> Result<Self> {
        ensure_records(records)?;

        let columns: Vec<ColumnDescriptor<T>> = schema
            .load_columns(server_generated_key)
            .into_iter()
            .cloned()
            .collect();
        if columns.is_empty() {
            return Err(PgExtError::Validation(format!(
                "No columns to load into '{}'",
                schema.table()
            )));
        }

        let statement = copy_statement(schema.table(), columns.iter().map(|c| c.name.as_str()));

        Ok(Self {
            table: schema.table().to_string(),
            records,
            server_generated_key,
            columns,
            statement,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn records(&self) -> &[T] {
        self.records
    }

    pub fn server_generated_key(&self) -> bool {
        self.server_generated_key
    }

    pub fn columns(&self) -> &[ColumnDescriptor<T>] {
        &self.columns
    }

    /// The `COPY ... FROM STDIN (FORMAT BINARY)` statement.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn column_types(&self) -> Vec<PgType> {
        self.columns.iter().map(|c| c.pg_type.clone()).collect()
    }
}

fn ensure_records<T>(records: &[T]) -> Result<()> {
    if records.is_empty() {
        return Err(PgExtError::Validation(
            "Cannot bulk load an empty batch".to_string(),
        ));
    }
    Ok(())
}

/// Builds `COPY "<table>" ("a", "b") FROM STDIN (FORMAT BINARY)`.
pub fn copy_statement<'c>(table: &str, columns: impl IntoIterator<Item = &'c str>) -> String {
    let column_list = columns
        .into_iter()
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({}) FROM STDIN (FORMAT BINARY)",
        quote_identifier(table),
        column_list
    )
}

/// Converts a value read off a record into what the column stores.
///
/// Enumeration members become their underlying integer. Lists of members
/// become integer arrays only when the column maps to an array type;
/// otherwise they are passed through unchanged.
pub fn coerce_value(kind: ColumnKind, pg_type: &PgType, value: ExtractedValue) -> ExtractedValue {
    match (kind, value) {
        (ColumnKind::Enum, ExtractedValue::Enum(member)) => member.repr.into_value(),
        (ColumnKind::EnumList, ExtractedValue::Array(members)) if pg_type.is_array() => {
            ExtractedValue::Array(
                members
                    .into_iter()
                    .map(|v| match v {
                        ExtractedValue::Enum(member) => member.repr.into_value(),
                        other => other,
                    })
                    .collect(),
            )
        }
        (_, value) => value,
    }
}

/// Encodes every record of the request into `sink`, then finishes it.
///
/// Any failure aborts the sink, so the server discards the partial copy.
/// Returns the row count the sink reports.
pub async fn copy_records<T, S>(
    mut sink: S,
    request: &LoadRequest<'_, T>,
    send_buffer_size: usize,
) -> Result<u64>
where
    S: CopySink,
{
    match send_records(&mut sink, request, send_buffer_size).await {
        Ok(()) => sink.finish().await,
        Err(e) => {
            if let Err(abort_error) = sink.abort(&e.to_string()).await {
                warn!(error = %abort_error, "Failed to abort copy stream");
            }
            Err(e)
        }
    }
}

async fn send_records<T, S>(
    sink: &mut S,
    request: &LoadRequest<'_, T>,
    send_buffer_size: usize,
) -> Result<()>
where
    S: CopySink,
{
    let mut encoder = BinaryCopyEncoder::new(request.column_types())?;

    for record in request.records {
        encoder.start_row()?;
        for column in &request.columns {
            let value = coerce_value(column.kind, &column.pg_type, column.read(record));
            encoder.write(&value)?;
        }
        if encoder.buffered_len() >= send_buffer_size {
            sink.send(encoder.take_chunk()).await?;
        }
    }

    encoder.finish()?;
    sink.send(encoder.take_chunk()).await
}

/// Loads batches of registered entities with the binary copy protocol.
#[derive(Debug, Clone)]
pub struct BulkLoader {
    conn: Connection,
    config: BulkConfig,
    registry: Option<Arc<SchemaRegistry>>,
}

impl BulkLoader {
    /// Creates a loader that resolves schemas from [`SchemaRegistry::global`].
    pub fn new(conn: Connection, config: BulkConfig) -> Self {
        Self {
            conn,
            config,
            registry: None,
        }
    }

    /// Resolves schemas from `registry` instead of the global one.
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    fn registry(&self) -> &SchemaRegistry {
        self.registry
            .as_deref()
            .unwrap_or_else(|| SchemaRegistry::global())
    }

    fn request<'a, T: 'static>(
        &self,
        schema: &EntitySchema<T>,
        records: &'a [T],
    ) -> Result<LoadRequest<'a, T>> {
        LoadRequest::new(schema, records, self.config.server_generated_key)
    }

    /// Loads `records` over a new physical connection, closed afterwards.
    ///
    /// Rows commit when the copy completes; a failed copy commits nothing.
    #[instrument(skip(self, records), fields(entity = type_name::<T>(), rows = records.len()))]
    pub async fn load<T: 'static>(&self, records: &[T]) -> Result<BulkResult> {
        ensure_records(records)?;
        let schema = self.registry().resolve::<T>()?;
        let request = self.request(&schema, records)?;

        let mut conn = self.conn.open().await?;
        let result = self.stream(&mut conn, &request).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close bulk load connection");
        }
        result
    }

    /// Loads `records` over a connection the caller owns.
    ///
    /// Pass a `sqlx::Transaction` (`&mut tx`) to make the rows part of it.
    #[instrument(skip(self, conn, records), fields(entity = type_name::<T>(), rows = records.len()))]
    pub async fn load_with<T: 'static>(
        &self,
        conn: &mut PgConnection,
        records: &[T],
    ) -> Result<BulkResult> {
        ensure_records(records)?;
        let schema = self.registry().resolve::<T>()?;
        let request = self.request(&schema, records)?;
        self.stream(conn, &request).await
    }

    /// Loads with an explicit schema, bypassing the registry.
    pub async fn load_schema<T>(
        &self,
        conn: &mut PgConnection,
        schema: &EntitySchema<T>,
        records: &[T],
    ) -> Result<BulkResult> {
        let request = LoadRequest::new(schema, records, self.config.server_generated_key)?;
        self.stream(conn, &request).await
    }

    /// Blocking form of [`load`](Self::load).
    ///
    /// Drives the load on a scoped helper thread with its own current-thread
    /// runtime, so it can be called from plain threads and `spawn_blocking`.
    pub fn load_blocking<T: Sync + 'static>(&self, records: &[T]) -> Result<BulkResult> {
        ensure_records(records)?;

        std::thread::scope(|scope| {
            let worker = scope.spawn(|| {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| {
                        PgExtError::Connection(format!("Failed to start copy runtime: {}", e))
                    })?;
                runtime.block_on(self.load(records))
            });
            match worker.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    }

    async fn stream<T>(
        &self,
        conn: &mut PgConnection,
        request: &LoadRequest<'_, T>,
    ) -> Result<BulkResult> {
        let started = Instant::now();
        debug!(
            table = %request.table(),
            columns = request.columns().len(),
            rows = request.records().len(),
            "Resolved copy columns"
        );
        info!(statement = %request.statement(), "Starting binary copy");

        let copy_in = conn.copy_in_raw(request.statement()).await?;
        let rows_copied = copy_records(copy_in, request, self.config.send_buffer_size).await?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(rows_copied, elapsed_ms, "Binary copy complete");
        Ok(BulkResult {
            rows_copied,
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnumRepr, PgEnum};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Clone, Copy)]
    enum Status {
        Active,
        Inactive,
        Banned,
    }

    impl PgEnum for Status {
        fn label(&self) -> &'static str {
            match self {
                Status::Active => "Active",
                Status::Inactive => "Inactive",
                Status::Banned => "Banned",
            }
        }

        fn repr(&self) -> EnumRepr {
            EnumRepr::I32(*self as i32)
        }
    }

    struct Account {
        id: i64,
        status: Status,
        roles: Vec<Status>,
    }

    fn account_schema(roles_type: PgType) -> EntitySchema<Account> {
        EntitySchema::builder("Accounts")
            .primary_key("Id", PgType::Int8, |a: &Account| a.id.into())
            .enum_column("Status", PgType::Int4, |a: &Account| {
                ExtractedValue::from_enum(&a.status)
            })
            .enum_list_column("Roles", roles_type, |a: &Account| {
                ExtractedValue::enum_list(&a.roles)
            })
            .build()
            .unwrap()
    }

    #[derive(Debug, Clone, PartialEq)]
    enum SinkEvent {
        Sent(Bytes),
        Finished,
        Aborted(String),
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<SinkEvent>>>,
        fail_sends: bool,
        rows: u64,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().clone()
        }

        fn sent_bytes(&self) -> Vec<u8> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    SinkEvent::Sent(chunk) => Some(chunk.to_vec()),
                    _ => None,
                })
                .flatten()
                .collect()
        }
    }

    #[async_trait]
    impl CopySink for RecordingSink {
        async fn send(&mut self, chunk: Bytes) -> Result<()> {
            if self.fail_sends {
                return Err(PgExtError::Connection("connection reset".to_string()));
            }
            self.events.lock().push(SinkEvent::Sent(chunk));
            Ok(())
        }

        async fn finish(self) -> Result<u64> {
            self.events.lock().push(SinkEvent::Finished);
            Ok(self.rows)
        }

        async fn abort(self, reason: &str) -> Result<()> {
            self.events.lock().push(SinkEvent::Aborted(reason.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_bulk_config_default() {
        let config = BulkConfig::default();
        assert!(config.server_generated_key);
        assert_eq!(config.send_buffer_size, 64 * 1024);
    }

    #[test]
    fn test_bulk_config_builder() {
        let config = BulkConfig::new()
            .server_generated_key(false)
            .send_buffer_size(0);

        assert!(!config.server_generated_key);
        assert_eq!(config.send_buffer_size, 1);
    }

    #[test]
    fn test_copy_statement_quotes_identifiers() {
        let sql = copy_statement("Users", ["Name", "Status"]);
        assert_eq!(
            sql,
            "COPY \"Users\" (\"Name\", \"Status\") FROM STDIN (FORMAT BINARY)"
        );
    }

    #[test]
    fn test_load_request_excludes_generated_key() {
        let schema = account_schema(PgType::array_of(PgType::Int4));
        let records = [Account { id: 1, status: Status::Active, roles: vec![] }];

        let request = LoadRequest::new(&schema, &records, true).unwrap();
        assert_eq!(
            request.statement(),
            "COPY \"Accounts\" (\"Status\", \"Roles\") FROM STDIN (FORMAT BINARY)"
        );

        let request = LoadRequest::new(&schema, &records, false).unwrap();
        assert_eq!(request.columns().len(), 3);
        assert!(request.statement().contains("\"Id\""));
    }

    #[test]
    fn test_load_request_rejects_empty_batch() {
        let schema = account_schema(PgType::array_of(PgType::Int4));
        let result = LoadRequest::new(&schema, &[], true);
        assert!(matches!(result, Err(PgExtError::Validation(_))));
    }

    #[test]
    fn test_load_request_rejects_empty_column_list() {
        let schema = EntitySchema::builder("Keys")
            .primary_key("Id", PgType::Int8, |a: &Account| a.id.into())
            .build()
            .unwrap();
        let records = [Account { id: 1, status: Status::Active, roles: vec![] }];

        let result = LoadRequest::new(&schema, &records, true);
        assert!(matches!(result, Err(PgExtError::Validation(_))));
    }

    #[test]
    fn test_coerce_enum_to_integer() {
        let value = coerce_value(
            ColumnKind::Enum,
            &PgType::Int4,
            ExtractedValue::from_enum(&Status::Banned),
        );
        assert_eq!(value, ExtractedValue::Int(2));

        let null = coerce_value(ColumnKind::Enum, &PgType::Int4, ExtractedValue::Null);
        assert_eq!(null, ExtractedValue::Null);
    }

    #[test]
    fn test_coerce_enum_list_for_array_column() {
        let value = coerce_value(
            ColumnKind::EnumList,
            &PgType::array_of(PgType::Int4),
            ExtractedValue::enum_list(&[Status::Active, Status::Banned]),
        );
        assert_eq!(
            value,
            ExtractedValue::Array(vec![ExtractedValue::Int(0), ExtractedValue::Int(2)])
        );
    }

    #[test]
    fn test_coerce_enum_list_passthrough_for_scalar_column() {
        let original = ExtractedValue::enum_list(&[Status::Inactive]);
        let value = coerce_value(ColumnKind::EnumList, &PgType::Jsonb, original.clone());
        assert_eq!(value, original);
    }

    #[test]
    fn test_coerce_scalar_untouched() {
        let value = coerce_value(ColumnKind::Scalar, &PgType::Text, "x".into());
        assert_eq!(value, ExtractedValue::String("x".to_string()));
    }

    #[test]
    fn test_copy_records_streams_and_finishes() {
        let schema = account_schema(PgType::array_of(PgType::Int4));
        let records = [Account { id: 1, status: Status::Banned, roles: vec![Status::Inactive] }];
        let request = LoadRequest::new(&schema, &records, true).unwrap();

        let sink = RecordingSink { rows: 1, ..Default::default() };
        let rows = tokio_test::block_on(copy_records(sink.clone(), &request, 64 * 1024)).unwrap();
        assert_eq!(rows, 1);

        let events = sink.events();
        assert_eq!(events.last(), Some(&SinkEvent::Finished));

        let bytes = sink.sent_bytes();
        // 19-byte header, then: field count, Status (len 4, value 2)
        assert_eq!(&bytes[19..21], &2i16.to_be_bytes());
        assert_eq!(&bytes[21..25], &4i32.to_be_bytes());
        assert_eq!(&bytes[25..29], &2i32.to_be_bytes());
        // Roles array: ndim 1, no nulls, int4 elements, one element with value 1
        assert_eq!(&bytes[33..37], &1i32.to_be_bytes());
        assert_eq!(&bytes[41..45], &23u32.to_be_bytes());
        assert_eq!(&bytes[53..57], &4i32.to_be_bytes());
        assert_eq!(&bytes[57..61], &1i32.to_be_bytes());
        // Trailer
        assert_eq!(&bytes[bytes.len() - 2..], &(-1i16).to_be_bytes());
    }

    #[test]
    fn test_copy_records_flushes_when_buffer_fills() {
        let schema = account_schema(PgType::array_of(PgType::Int4));
        let records: Vec<Account> = (0..10)
            .map(|i| Account { id: i, status: Status::Active, roles: vec![] })
            .collect();
        let request = LoadRequest::new(&schema, &records, true).unwrap();

        let sink = RecordingSink::default();
        tokio_test::block_on(copy_records(sink.clone(), &request, 1)).unwrap();

        let sends = sink
            .events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Sent(_)))
            .count();
        // One chunk per row plus the trailer
        assert_eq!(sends, 11);
    }

    #[test]
    fn test_copy_records_aborts_on_encode_error() {
        // Enum lists cannot be written to a bytea column.
        let schema = account_schema(PgType::Bytea);
        let records = [Account { id: 1, status: Status::Active, roles: vec![Status::Active] }];
        let request = LoadRequest::new(&schema, &records, true).unwrap();

        let sink = RecordingSink::default();
        let result = tokio_test::block_on(copy_records(sink.clone(), &request, 64 * 1024));
        assert!(matches!(result, Err(PgExtError::Protocol(_))));

        let events = sink.events();
        assert!(matches!(events.last(), Some(SinkEvent::Aborted(_))));
        assert!(!events.contains(&SinkEvent::Finished));
    }

    #[test]
    fn test_copy_records_aborts_on_send_error() {
        let schema = account_schema(PgType::array_of(PgType::Int4));
        let records = [Account { id: 1, status: Status::Active, roles: vec![] }];
        let request = LoadRequest::new(&schema, &records, true).unwrap();

        let sink = RecordingSink { fail_sends: true, ..Default::default() };
        let result = tokio_test::block_on(copy_records(sink.clone(), &request, 64 * 1024));
        assert!(matches!(result, Err(PgExtError::Connection(_))));
        assert_eq!(
            sink.events(),
            vec![SinkEvent::Aborted("Connection error: connection reset".to_string())]
        );
    }

    #[test]
    fn test_load_rejects_empty_batch_before_io() {
        // Unreachable port: any I/O attempt would fail with a Connection error.
        let conn = Connection::new("postgresql://localhost:1/none", Default::default()).unwrap();
        let loader = BulkLoader::new(conn, BulkConfig::default());

        let result = tokio_test::block_on(loader.load::<Account>(&[]));
        assert!(matches!(result, Err(PgExtError::Validation(_))));

        let result = loader.load_blocking::<Account>(&[]);
        assert!(matches!(result, Err(PgExtError::Validation(_))));
    }

    #[test]
    fn test_load_unregistered_entity() {
        struct NotRegistered;

        let conn = Connection::new("postgresql://localhost:1/none", Default::default()).unwrap();
        let loader = BulkLoader::new(conn, BulkConfig::default())
            .with_registry(Arc::new(SchemaRegistry::new()));

        let result = tokio_test::block_on(loader.load(&[NotRegistered]));
        assert!(matches!(result, Err(PgExtError::SchemaResolution(_))));
    }
}
