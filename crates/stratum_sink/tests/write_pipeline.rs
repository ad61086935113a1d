//! End-to-end write pipeline behavior against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Decimal128Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use stratum_client::{
    ColumnSchema, ColumnType, ConnectionConfig, InMemoryCluster, InMemoryConnector, MutationKind,
    TableSchema, Value,
};
use stratum_sink::{SinkConfig, SinkContext, SinkError, WriteOptions};

const ADDR: &str = "stratum-test:7051";

struct Harness {
    cluster: Arc<InMemoryCluster>,
    context: SinkContext,
    cluster_config: ConnectionConfig,
}

fn harness() -> Harness {
    let cluster = InMemoryCluster::new();
    let connector = InMemoryConnector::new();
    connector.register(ADDR, Arc::clone(&cluster));
    let cluster_config = ConnectionConfig::new(vec![ADDR.to_string()]);
    let context = SinkContext::new(
        cluster_config.clone(),
        Arc::new(connector),
        SinkConfig::default(),
    );
    Harness {
        cluster,
        context,
        cluster_config,
    }
}

fn orders_table() -> TableSchema {
    TableSchema::new(vec![
        ColumnSchema::key("order_id", ColumnType::Int64),
        ColumnSchema::new("status", ColumnType::Text, true),
        ColumnSchema::new("total_cents", ColumnType::Int64, false),
        ColumnSchema::new("note", ColumnType::Text, true),
    ])
    .expect("valid orders schema")
}

fn orders_batch(
    ids: &[Option<i64>],
    statuses: &[Option<&str>],
    totals: &[Option<i64>],
    notes: &[Option<&str>],
) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("order_id", DataType::Int64, true),
        Field::new("status", DataType::Utf8, true),
        Field::new("total_cents", DataType::Int64, true),
        Field::new("note", DataType::Utf8, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef,
            Arc::new(StringArray::from(statuses.to_vec())),
            Arc::new(Int64Array::from(totals.to_vec())),
            Arc::new(StringArray::from(notes.to_vec())),
        ],
    )
    .context("build orders batch")
}

fn simple_orders_batch(rows: &[(i64, &str, i64)]) -> Result<RecordBatch> {
    orders_batch(
        &rows.iter().map(|r| Some(r.0)).collect::<Vec<_>>(),
        &rows.iter().map(|r| Some(r.1)).collect::<Vec<_>>(),
        &rows.iter().map(|r| Some(r.2)).collect::<Vec<_>>(),
        &rows.iter().map(|_| Some("note")).collect::<Vec<_>>(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn round_trip_fidelity_over_all_supported_types() -> Result<()> {
    let h = harness();
    h.cluster.create_table(
        "wide",
        TableSchema::new(vec![
            ColumnSchema::key("id", ColumnType::Int64),
            ColumnSchema::new("name", ColumnType::Text, true),
            ColumnSchema::new("blob", ColumnType::Binary, true),
            ColumnSchema::new("flag", ColumnType::Bool, true),
            ColumnSchema::new("tiny", ColumnType::Int8, true),
            ColumnSchema::new("small", ColumnType::Int16, true),
            ColumnSchema::new("medium", ColumnType::Int32, true),
            ColumnSchema::new("ratio", ColumnType::Float32, true),
            ColumnSchema::new("amount", ColumnType::Float64, true),
            ColumnSchema::new("at", ColumnType::TimestampMicros, true),
            ColumnSchema::new(
                "price",
                ColumnType::Decimal {
                    precision: 18,
                    scale: 3,
                },
                true,
            ),
        ])?,
    );

    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("blob", DataType::Binary, true),
        Field::new("flag", DataType::Boolean, true),
        Field::new("tiny", DataType::Int8, true),
        Field::new("small", DataType::Int16, true),
        Field::new("medium", DataType::Int32, true),
        Field::new("ratio", DataType::Float32, true),
        Field::new("amount", DataType::Float64, true),
        Field::new("at", DataType::Timestamp(TimeUnit::Microsecond, None), true),
        Field::new("price", DataType::Decimal128(18, 3), true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![i64::MIN, i64::MAX])) as ArrayRef,
            Arc::new(StringArray::from(vec!["", "høly strings ✓"])),
            Arc::new(BinaryArray::from(vec![&b""[..], &b"\x00\xff\x01"[..]])),
            Arc::new(BooleanArray::from(vec![false, true])),
            Arc::new(Int8Array::from(vec![i8::MIN, i8::MAX])),
            Arc::new(Int16Array::from(vec![i16::MIN, i16::MAX])),
            Arc::new(Int32Array::from(vec![i32::MIN, i32::MAX])),
            Arc::new(Float32Array::from(vec![-3.5f32, 3.5f32])),
            Arc::new(Float64Array::from(vec![f64::MIN, f64::MAX])),
            Arc::new(TimestampMicrosecondArray::from(vec![
                0i64,
                1_700_000_000_000_000,
            ])),
            Arc::new(
                Decimal128Array::from(vec![-999_999_999_999_999_999i128, 999_999_999_999_999_999])
                    .with_precision_and_scale(18, 3)?,
            ),
        ],
    )?;

    h.context
        .write(vec![batch], "wide", MutationKind::Insert, WriteOptions::default())
        .await?;

    let min_row = h
        .cluster
        .get_row("wide", &[Value::Int64(i64::MIN)])
        .context("min row should exist")?;
    assert_eq!(min_row[1], Some(Value::Text(String::new())));
    assert_eq!(min_row[2], Some(Value::Binary(Vec::new())));
    assert_eq!(min_row[3], Some(Value::Bool(false)));
    assert_eq!(min_row[4], Some(Value::Int8(i8::MIN)));
    assert_eq!(min_row[5], Some(Value::Int16(i16::MIN)));
    assert_eq!(min_row[6], Some(Value::Int32(i32::MIN)));
    assert_eq!(min_row[7], Some(Value::Float32(-3.5)));
    assert_eq!(min_row[8], Some(Value::Float64(f64::MIN)));
    assert_eq!(min_row[9], Some(Value::TimestampMicros(0)));
    assert_eq!(min_row[10], Some(Value::Decimal(-999_999_999_999_999_999)));

    let max_row = h
        .cluster
        .get_row("wide", &[Value::Int64(i64::MAX)])
        .context("max row should exist")?;
    assert_eq!(max_row[1], Some(Value::Text("høly strings ✓".to_string())));
    assert_eq!(max_row[2], Some(Value::Binary(vec![0x00, 0xff, 0x01])));
    assert_eq!(max_row[3], Some(Value::Bool(true)));
    assert_eq!(max_row[4], Some(Value::Int8(i8::MAX)));
    assert_eq!(max_row[5], Some(Value::Int16(i16::MAX)));
    assert_eq!(max_row[6], Some(Value::Int32(i32::MAX)));
    assert_eq!(max_row[7], Some(Value::Float32(3.5)));
    assert_eq!(max_row[8], Some(Value::Float64(f64::MAX)));
    assert_eq!(max_row[9], Some(Value::TimestampMicros(1_700_000_000_000_000)));
    assert_eq!(max_row[10], Some(Value::Decimal(999_999_999_999_999_999)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn null_key_aborts_the_partition_with_zero_mutations() -> Result<()> {
    for kind in [
        MutationKind::Insert,
        MutationKind::Upsert,
        MutationKind::Update,
    ] {
        let h = harness();
        h.cluster.create_table("orders", orders_table());
        let batch = orders_batch(&[None], &[Some("new")], &[Some(100)], &[None])?;

        let err = h
            .context
            .write(vec![batch], "orders", kind, WriteOptions::default())
            .await
            .expect_err("null key must fail");
        assert!(
            matches!(err, SinkError::NullKey { ref column } if column == "order_id"),
            "unexpected error for {kind:?}: {err}"
        );
        assert_eq!(h.cluster.row_count("orders"), Some(0));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_reads_only_key_columns() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    h.context
        .write(
            vec![simple_orders_batch(&[(1, "new", 100)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;

    // Every non-key value is null, including the non-nullable total_cents;
    // deletes must not read or validate them.
    let delete = orders_batch(&[Some(1)], &[None], &[None], &[None])?;
    h.context
        .write(
            vec![delete],
            "orders",
            MutationKind::Delete,
            WriteOptions::default(),
        )
        .await?;
    assert_eq!(h.cluster.row_count("orders"), Some(0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn watermark_only_moves_forward() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    let conn = h.context.connection(&h.cluster_config).await?;
    assert_eq!(conn.observed_watermark(), 0);

    let mut last = 0;
    for id in 0..5 {
        h.context
            .write(
                vec![simple_orders_batch(&[(id, "new", 10)])?],
                "orders",
                MutationKind::Insert,
                WriteOptions::default(),
            )
            .await?;
        let observed = conn.observed_watermark();
        assert!(observed > last, "watermark must advance: {observed} vs {last}");
        last = observed;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_failures_report_count_and_samples() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    h.context
        .write(
            vec![simple_orders_batch(&[(5, "existing", 1)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;

    // Five rows, one of which collides with the pre-existing key.
    let rows: Vec<(i64, &str, i64)> = (1..=5).map(|id| (id, "new", 10)).collect();
    let err = h
        .context
        .write(
            vec![simple_orders_batch(&rows)?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await
        .expect_err("duplicate row must fail the call");

    match err {
        SinkError::RowFailures {
            count,
            samples,
            overflowed,
        } => {
            assert_eq!(count, 1);
            assert!(!overflowed);
            assert_eq!(samples.len(), 1);
            assert!(samples[0].contains("key already present"), "{samples:?}");
        }
        other => panic!("unexpected error: {other}"),
    }
    // The four non-colliding rows stayed committed.
    assert_eq!(h.cluster.row_count("orders"), Some(5));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_returns_one_connection_per_identity() -> Result<()> {
    let h = harness();
    let first = h.context.connection(&h.cluster_config).await?;
    let second = h.context.connection(&h.cluster_config).await?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.context.cached_connections().await, 1);

    let with_timeout = h
        .context
        .connection(
            &h.cluster_config
                .clone()
                .with_socket_read_timeout(Duration::from_secs(30)),
        )
        .await?;
    assert!(!Arc::ptr_eq(&first, &with_timeout));
    assert_eq!(h.context.cached_connections().await, 2);

    h.context.reset_connection_cache().await;
    assert_eq!(h.context.cached_connections().await, 0);

    // The cache rebuilds lazily after a reset.
    h.cluster.create_table("orders", orders_table());
    h.context
        .write(
            vec![simple_orders_batch(&[(1, "new", 10)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;
    assert_eq!(h.context.cached_connections().await, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_caches_nothing() -> Result<()> {
    let cluster_config = ConnectionConfig::new(vec!["nowhere:7051".to_string()]);
    let context = SinkContext::new(
        cluster_config,
        Arc::new(InMemoryConnector::new()),
        SinkConfig::default(),
    );
    let err = context
        .write(
            vec![simple_orders_batch(&[(1, "new", 10)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await
        .expect_err("no cluster is registered");
    assert!(matches!(err, SinkError::Client(_)), "{err}");
    assert_eq!(context.cached_connections().await, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn selective_update_touches_only_named_columns() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    h.context
        .write(
            vec![simple_orders_batch(&[(1, "new", 100)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;

    // Key-only input schema; status gets a literal, note an explicit null.
    let key_schema = Arc::new(Schema::new(vec![Field::new(
        "order_id",
        DataType::Int64,
        false,
    )]));
    let key_batch = RecordBatch::try_new(
        key_schema,
        vec![Arc::new(Int64Array::from(vec![1i64])) as ArrayRef],
    )?;
    let mut column_values = BTreeMap::new();
    column_values.insert("status".to_string(), Some("shipped".to_string()));
    column_values.insert("note".to_string(), None);
    h.context
        .update_columns(vec![key_batch], "orders", column_values)
        .await?;

    let row = h
        .cluster
        .get_row("orders", &[Value::Int64(1)])
        .context("row should exist")?;
    assert_eq!(row[1], Some(Value::Text("shipped".to_string())));
    assert_eq!(row[2], Some(Value::Int64(100)), "untouched column changed");
    assert_eq!(row[3], None, "explicit null marker should clear the note");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn selective_update_rejects_key_literals() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    let key_schema = Arc::new(Schema::new(vec![Field::new(
        "order_id",
        DataType::Int64,
        false,
    )]));
    let key_batch = RecordBatch::try_new(
        key_schema,
        vec![Arc::new(Int64Array::from(vec![1i64])) as ArrayRef],
    )?;
    let mut column_values = BTreeMap::new();
    column_values.insert("order_id".to_string(), Some("2".to_string()));
    let err = h
        .context
        .update_columns(vec![key_batch], "orders", column_values)
        .await
        .expect_err("key literals are rejected");
    assert!(
        matches!(err, SinkError::KeyFromLiterals { ref column } if column == "order_id"),
        "{err}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_suppression_toggle() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    h.context
        .write(
            vec![simple_orders_batch(&[(1, "original", 100)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;

    // Suppression off: the duplicate fails the call.
    let err = h
        .context
        .write(
            vec![simple_orders_batch(&[(1, "second", 200)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await
        .expect_err("duplicate without suppression fails");
    assert!(matches!(err, SinkError::RowFailures { count: 1, .. }), "{err}");

    // Suppression on: the duplicate is a no-op success.
    h.context
        .write(
            vec![simple_orders_batch(&[(1, "second", 200)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions {
                ignore_duplicate_rows: true,
                ..WriteOptions::default()
            },
        )
        .await?;
    let row = h
        .cluster
        .get_row("orders", &[Value::Int64(1)])
        .context("row should exist")?;
    assert_eq!(row[1], Some(Value::Text("original".to_string())));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ignore_null_preserves_stored_values_on_upsert() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    h.context
        .write(
            vec![simple_orders_batch(&[(1, "original", 100)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;

    // Null status with ignore_null: the stored status survives.
    let upsert = orders_batch(&[Some(1)], &[None], &[Some(150)], &[Some("note")])?;
    h.context
        .write(
            vec![upsert],
            "orders",
            MutationKind::Upsert,
            WriteOptions {
                ignore_null: true,
                ..WriteOptions::default()
            },
        )
        .await?;
    let row = h.cluster.get_row("orders", &[Value::Int64(1)]).unwrap();
    assert_eq!(row[1], Some(Value::Text("original".to_string())));
    assert_eq!(row[2], Some(Value::Int64(150)));

    // Without ignore_null the same upsert writes an explicit NULL.
    let upsert = orders_batch(&[Some(1)], &[None], &[Some(175)], &[Some("note")])?;
    h.context
        .write(
            vec![upsert],
            "orders",
            MutationKind::Upsert,
            WriteOptions::default(),
        )
        .await?;
    let row = h.cluster.get_row("orders", &[Value::Int64(1)]).unwrap();
    assert_eq!(row[1], None);
    assert_eq!(row[2], Some(Value::Int64(175)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_input_column_is_a_configuration_error() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    let schema = Arc::new(Schema::new(vec![
        Field::new("order_id", DataType::Int64, false),
        Field::new("no_such_column", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![1i64])) as ArrayRef,
            Arc::new(StringArray::from(vec!["x"])),
        ],
    )?;
    let err = h
        .context
        .write(
            vec![batch],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await
        .expect_err("unknown column must fail");
    assert!(
        matches!(err, SinkError::UnknownColumn { ref column, .. } if column == "no_such_column"),
        "{err}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_partitions_all_commit_and_metrics_merge() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());

    let mut partitions = Vec::new();
    for p in 0..4i64 {
        let rows: Vec<(i64, &str, i64)> =
            (0..25).map(|i| (p * 25 + i, "bulk", i)).collect();
        partitions.push(simple_orders_batch(&rows)?);
    }
    h.context
        .write(
            partitions,
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;

    assert_eq!(h.cluster.row_count("orders"), Some(100));
    let snapshot = h.context.metrics().snapshot();
    assert_eq!(snapshot.rows_inserted, 100);
    assert_eq!(snapshot.partitions, 4);
    assert_eq!(snapshot.durations.count, 4);
    let rendered = h.context.metrics().render_text();
    assert!(rendered.contains("rows_inserted=100"), "{rendered}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_write_is_a_no_op_success() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    // No partitions at all.
    h.context
        .write(
            Vec::new(),
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;
    // One partition with zero rows.
    h.context
        .write(
            vec![simple_orders_batch(&[])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;
    assert_eq!(h.cluster.row_count("orders"), Some(0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_connections_receive_the_coordinator_credential() -> Result<()> {
    let h = harness();
    h.cluster.create_table("orders", orders_table());
    h.context
        .write(
            vec![simple_orders_batch(&[(1, "new", 10)])?],
            "orders",
            MutationKind::Insert,
            WriteOptions::default(),
        )
        .await?;
    assert!(h.cluster.imported_credential().is_some());
    Ok(())
}
