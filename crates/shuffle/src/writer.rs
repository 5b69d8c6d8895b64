//! Map-side hash partitioning of record batches.
//!
//! Rows are routed to reducer slots by hashing their key columns with the
//! std hasher over a typed scalar key; each slot is encoded as one Arrow IPC
//! stream so the registered payload size is also the byte statistic.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::RecordBatch;
use stageflow_common::{Result, SfError};

use crate::store::MapPartitionPayload;

#[derive(Debug, Clone, PartialEq)]
enum ScalarValue {
    Int64(i64),
    Float64Bits(u64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Int64(v) => {
                0_u8.hash(state);
                v.hash(state);
            }
            Self::Float64Bits(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Self::Utf8(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Self::Boolean(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
            Self::Null => 4_u8.hash(state),
        }
    }
}

fn scalar_from_array(arr: &ArrayRef, idx: usize) -> Result<ScalarValue> {
    if arr.is_null(idx) {
        return Ok(ScalarValue::Null);
    }
    if let Some(a) = arr.as_any().downcast_ref::<Int64Array>() {
        return Ok(ScalarValue::Int64(a.value(idx)));
    }
    if let Some(a) = arr.as_any().downcast_ref::<Float64Array>() {
        return Ok(ScalarValue::Float64Bits(a.value(idx).to_bits()));
    }
    if let Some(a) = arr.as_any().downcast_ref::<StringArray>() {
        return Ok(ScalarValue::Utf8(a.value(idx).to_string()));
    }
    if let Some(a) = arr.as_any().downcast_ref::<BooleanArray>() {
        return Ok(ScalarValue::Boolean(a.value(idx)));
    }
    Err(SfError::Execution(format!(
        "unsupported shuffle column type {:?}",
        arr.data_type()
    )))
}

fn rows_from_batches(batches: &[RecordBatch]) -> Result<Vec<Vec<ScalarValue>>> {
    let mut out = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let mut values = Vec::with_capacity(batch.num_columns());
            for col in 0..batch.num_columns() {
                values.push(scalar_from_array(batch.column(col), row)?);
            }
            out.push(values);
        }
    }
    Ok(out)
}

fn scalars_to_array(values: &[ScalarValue], data_type: &DataType) -> Result<ArrayRef> {
    match data_type {
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int64(x) => builder.append_value(*x),
                    ScalarValue::Null => builder.append_null(),
                    other => {
                        return Err(SfError::Execution(format!(
                            "expected Int64 scalar, got {other:?}"
                        )))
                    }
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Float64Bits(x) => builder.append_value(f64::from_bits(*x)),
                    ScalarValue::Null => builder.append_null(),
                    other => {
                        return Err(SfError::Execution(format!(
                            "expected Float64 scalar, got {other:?}"
                        )))
                    }
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        DataType::Utf8 => {
            let mut builder = StringBuilder::new();
            for v in values {
                match v {
                    ScalarValue::Utf8(x) => builder.append_value(x),
                    ScalarValue::Null => builder.append_null(),
                    other => {
                        return Err(SfError::Execution(format!(
                            "expected Utf8 scalar, got {other:?}"
                        )))
                    }
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::new();
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => builder.append_value(*x),
                    ScalarValue::Null => builder.append_null(),
                    other => {
                        return Err(SfError::Execution(format!(
                            "expected Boolean scalar, got {other:?}"
                        )))
                    }
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        other => Err(SfError::Execution(format!(
            "unsupported shuffle column type {other:?}"
        ))),
    }
}

fn rows_to_batch(schema: &SchemaRef, rows: &[Vec<ScalarValue>]) -> Result<RecordBatch> {
    let mut cols = vec![Vec::<ScalarValue>::with_capacity(rows.len()); schema.fields().len()];
    for row in rows {
        for (idx, value) in row.iter().enumerate() {
            cols[idx].push(value.clone());
        }
    }
    let arrays = cols
        .iter()
        .enumerate()
        .map(|(idx, col)| scalars_to_array(col, schema.field(idx).data_type()))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(schema.clone(), arrays)
        .map_err(|e| SfError::Execution(format!("partition batch build failed: {e}")))
}

fn hash_key(key: &[ScalarValue]) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

/// Encode batches as a single Arrow IPC stream.
pub fn encode_ipc_bytes(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| SfError::Execution(format!("ipc writer init failed: {e}")))?;
        for b in batches {
            writer
                .write(b)
                .map_err(|e| SfError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| SfError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decode a single Arrow IPC stream back into batches.
pub fn decode_ipc_bytes(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    let cur = Cursor::new(bytes.to_vec());
    let reader = arrow::ipc::reader::StreamReader::try_new(cur, None)
        .map_err(|e| SfError::Execution(format!("ipc reader init failed: {e}")))?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SfError::Execution(format!("ipc read failed: {e}")))
}

/// Hash-partition one map task's batches into `num_reducers` encoded slots.
///
/// `key_indexes` are column offsets into the batch schema. Reducer slots the
/// mapper produced no rows for get an empty payload.
pub fn partition_batches(
    batches: &[RecordBatch],
    key_indexes: &[usize],
    num_reducers: u32,
) -> Result<Vec<MapPartitionPayload>> {
    let Some(first) = batches.first() else {
        return Ok((0..num_reducers)
            .map(|_| MapPartitionPayload {
                bytes: Vec::new(),
                rows: 0,
            })
            .collect());
    };
    if key_indexes.is_empty() {
        return Err(SfError::InvalidConfig(
            "hash partitioning requires at least one key column".to_string(),
        ));
    }
    let schema = first.schema();

    let rows = rows_from_batches(batches)?;
    let mut by_part = vec![Vec::<Vec<ScalarValue>>::new(); num_reducers as usize];
    for row in rows {
        let key = key_indexes
            .iter()
            .map(|i| row[*i].clone())
            .collect::<Vec<_>>();
        let part = (hash_key(&key) % num_reducers as u64) as usize;
        by_part[part].push(row);
    }

    by_part
        .into_iter()
        .map(|part_rows| {
            if part_rows.is_empty() {
                return Ok(MapPartitionPayload {
                    bytes: Vec::new(),
                    rows: 0,
                });
            }
            let rows = part_rows.len() as u64;
            let batch = rows_to_batch(&schema, &part_rows)?;
            Ok(MapPartitionPayload {
                bytes: encode_ipc_bytes(&schema, &[batch])?,
                rows,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    use super::*;

    fn batch(keys: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(keys))]).expect("batch")
    }

    #[test]
    fn routes_equal_keys_to_one_reducer() {
        let payloads =
            partition_batches(&[batch(vec![7, 7, 7, 7])], &[0], 4).expect("partition");
        assert_eq!(payloads.len(), 4);
        let non_empty = payloads.iter().filter(|p| p.rows > 0).count();
        assert_eq!(non_empty, 1);
        assert_eq!(payloads.iter().map(|p| p.rows).sum::<u64>(), 4);
    }

    #[test]
    fn partitioning_is_deterministic() {
        let a = partition_batches(&[batch(vec![1, 2, 3, 4, 5])], &[0], 3).expect("a");
        let b = partition_batches(&[batch(vec![1, 2, 3, 4, 5])], &[0], 3).expect("b");
        let rows_a = a.iter().map(|p| p.rows).collect::<Vec<_>>();
        let rows_b = b.iter().map(|p| p.rows).collect::<Vec<_>>();
        assert_eq!(rows_a, rows_b);
    }

    #[test]
    fn round_trips_through_ipc() {
        let b = batch(vec![1, 2, 3]);
        let bytes = encode_ipc_bytes(&b.schema(), &[b]).expect("encode");
        let back = decode_ipc_bytes(&bytes).expect("decode");
        assert_eq!(back.iter().map(|x| x.num_rows()).sum::<usize>(), 3);
    }

    #[test]
    fn empty_input_yields_empty_slots() {
        let payloads = partition_batches(&[], &[0], 2).expect("partition");
        assert_eq!(payloads.len(), 2);
        assert!(payloads.iter().all(|p| p.bytes.is_empty() && p.rows == 0));
    }
}
