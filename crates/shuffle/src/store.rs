//! In-process map-output store.
//!
//! Contract:
//! - map outputs are registered whole (one call per completed map task, one
//!   encoded payload slot per reducer id);
//! - reads address a reducer range crossed with a mapper range and return
//!   batches in mapper-major order;
//! - the store answers the preferred-location contract from the hosts
//!   recorded at registration time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use arrow::record_batch::RecordBatch;
use stageflow_common::{Result, SfError, ShuffleId};

use crate::partition::ShuffleReadPartition;
use crate::stats::MapOutputStatistics;
use crate::writer::decode_ipc_bytes;

/// Identity and dimensions of one registered shuffle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleHandle {
    /// Store-assigned shuffle identity.
    pub id: ShuffleId,
    /// Pre-shuffle partition count `P`.
    pub num_reducers: u32,
    /// Number of registered map tasks.
    pub num_mappers: u32,
}

/// One reducer slot of a completed map task.
#[derive(Debug, Clone)]
pub struct MapPartitionPayload {
    /// Arrow IPC stream bytes; empty when the mapper produced no rows for
    /// this reducer.
    pub bytes: Vec<u8>,
    /// Row count inside `bytes`.
    pub rows: u64,
}

#[derive(Debug)]
struct MapTaskOutput {
    host: String,
    partitions: Vec<MapPartitionPayload>,
}

#[derive(Debug)]
struct ShuffleState {
    num_reducers: u32,
    maps: Vec<MapTaskOutput>,
}

/// Process-wide registry of in-flight shuffle outputs.
#[derive(Debug, Default)]
pub struct ShuffleStore {
    next_id: AtomicU64,
    shuffles: RwLock<HashMap<ShuffleId, ShuffleState>>,
}

impl ShuffleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new shuffle with a fixed reducer count.
    pub fn create_shuffle(&self, num_reducers: u32) -> Result<ShuffleId> {
        if num_reducers == 0 {
            return Err(SfError::InvalidConfig(
                "shuffle must declare at least one reducer".to_string(),
            ));
        }
        let id = ShuffleId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.shuffles
            .write()
            .expect("shuffle store lock poisoned")
            .insert(
                id,
                ShuffleState {
                    num_reducers,
                    maps: Vec::new(),
                },
            );
        Ok(id)
    }

    /// Register one completed map task and return its mapper id.
    pub fn register_map_output(
        &self,
        shuffle: ShuffleId,
        host: impl Into<String>,
        partitions: Vec<MapPartitionPayload>,
    ) -> Result<u32> {
        let mut shuffles = self.shuffles.write().expect("shuffle store lock poisoned");
        let state = shuffles
            .get_mut(&shuffle)
            .ok_or_else(|| SfError::Execution(format!("unknown shuffle {shuffle}")))?;
        if partitions.len() != state.num_reducers as usize {
            return Err(SfError::InvalidConfig(format!(
                "map output has {} reducer slots, shuffle {shuffle} declares {}",
                partitions.len(),
                state.num_reducers
            )));
        }
        let map_id = state.maps.len() as u32;
        state.maps.push(MapTaskOutput {
            host: host.into(),
            partitions,
        });
        Ok(map_id)
    }

    /// Identity and dimensions of a registered shuffle.
    pub fn handle(&self, shuffle: ShuffleId) -> Result<ShuffleHandle> {
        let shuffles = self.shuffles.read().expect("shuffle store lock poisoned");
        let state = shuffles
            .get(&shuffle)
            .ok_or_else(|| SfError::Execution(format!("unknown shuffle {shuffle}")))?;
        Ok(ShuffleHandle {
            id: shuffle,
            num_reducers: state.num_reducers,
            num_mappers: state.maps.len() as u32,
        })
    }

    /// Aggregate per-reducer statistics over all registered map tasks.
    pub fn map_output_statistics(&self, shuffle: ShuffleId) -> Result<MapOutputStatistics> {
        let shuffles = self.shuffles.read().expect("shuffle store lock poisoned");
        let state = shuffles
            .get(&shuffle)
            .ok_or_else(|| SfError::Execution(format!("unknown shuffle {shuffle}")))?;
        let p = state.num_reducers as usize;
        let mut bytes = vec![0_u64; p];
        let mut rows = vec![0_u64; p];
        for map in &state.maps {
            for (r, payload) in map.partitions.iter().enumerate() {
                bytes[r] += payload.bytes.len() as u64;
                rows[r] += payload.rows;
            }
        }
        MapOutputStatistics::new(bytes, rows, state.maps.len() as u32)
    }

    /// Read one post-shuffle partition, mapper-major.
    ///
    /// Addressing outside the registered dimensions is a programming error.
    pub fn read(&self, shuffle: ShuffleId, part: &ShuffleReadPartition) -> Result<Vec<RecordBatch>> {
        let shuffles = self.shuffles.read().expect("shuffle store lock poisoned");
        let state = shuffles
            .get(&shuffle)
            .ok_or_else(|| SfError::Execution(format!("unknown shuffle {shuffle}")))?;
        assert!(
            part.reducer_end <= state.num_reducers,
            "reducer range crosses partition count"
        );
        assert!(
            part.map_end <= state.maps.len() as u32,
            "mapper range crosses map-task count"
        );

        let mut out = Vec::new();
        for map in &state.maps[part.map_start as usize..part.map_end as usize] {
            for payload in &map.partitions[part.reducer_start as usize..part.reducer_end as usize] {
                if payload.bytes.is_empty() {
                    continue;
                }
                out.extend(decode_ipc_bytes(&payload.bytes)?);
            }
        }
        Ok(out)
    }

    /// Hosts holding the outputs of mapper range `[map_start, map_end)`,
    /// deduplicated in registration order.
    pub fn map_locations(
        &self,
        shuffle: ShuffleId,
        map_start: u32,
        map_end: u32,
    ) -> Result<Vec<String>> {
        let shuffles = self.shuffles.read().expect("shuffle store lock poisoned");
        let state = shuffles
            .get(&shuffle)
            .ok_or_else(|| SfError::Execution(format!("unknown shuffle {shuffle}")))?;
        assert!(map_start < map_end, "empty mapper range");
        assert!(
            map_end <= state.maps.len() as u32,
            "mapper range crosses map-task count"
        );
        let mut hosts = Vec::new();
        for map in &state.maps[map_start as usize..map_end as usize] {
            if !hosts.contains(&map.host) {
                hosts.push(map.host.clone());
            }
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    use super::*;
    use crate::writer::encode_ipc_bytes;

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch")
    }

    fn payload(values: Vec<i64>) -> MapPartitionPayload {
        let rows = values.len() as u64;
        let b = batch(values);
        MapPartitionPayload {
            bytes: encode_ipc_bytes(&b.schema(), &[b]).expect("encode"),
            rows,
        }
    }

    fn empty_payload() -> MapPartitionPayload {
        MapPartitionPayload {
            bytes: Vec::new(),
            rows: 0,
        }
    }

    #[test]
    fn aggregates_statistics_across_mappers() {
        let store = ShuffleStore::new();
        let id = store.create_shuffle(2).expect("create");
        store
            .register_map_output(id, "host-a", vec![payload(vec![1, 2]), empty_payload()])
            .expect("map 0");
        store
            .register_map_output(id, "host-b", vec![payload(vec![3]), payload(vec![4])])
            .expect("map 1");

        let stats = store.map_output_statistics(id).expect("stats");
        assert_eq!(stats.num_mappers, 2);
        assert_eq!(stats.rows_by_partition, vec![3, 1]);
        assert!(stats.bytes_by_partition[0] > stats.bytes_by_partition[1]);
    }

    #[test]
    fn reads_mapper_ranges() {
        let store = ShuffleStore::new();
        let id = store.create_shuffle(1).expect("create");
        store
            .register_map_output(id, "host-a", vec![payload(vec![1])])
            .expect("map 0");
        store
            .register_map_output(id, "host-b", vec![payload(vec![2, 3])])
            .expect("map 1");

        let only_second = store
            .read(
                id,
                &ShuffleReadPartition {
                    reducer_start: 0,
                    reducer_end: 1,
                    map_start: 1,
                    map_end: 2,
                },
            )
            .expect("read");
        assert_eq!(only_second.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
    }

    #[test]
    fn exposes_preferred_locations() {
        let store = ShuffleStore::new();
        let id = store.create_shuffle(1).expect("create");
        for host in ["host-a", "host-b", "host-a"] {
            store
                .register_map_output(id, host, vec![payload(vec![7])])
                .expect("map");
        }
        assert_eq!(
            store.map_locations(id, 0, 3).expect("locations"),
            vec!["host-a".to_string(), "host-b".to_string()]
        );
        assert_eq!(
            store.map_locations(id, 1, 2).expect("locations"),
            vec!["host-b".to_string()]
        );
    }

    #[test]
    fn rejects_wrong_reducer_slot_count() {
        let store = ShuffleStore::new();
        let id = store.create_shuffle(2).expect("create");
        let err = store
            .register_map_output(id, "host-a", vec![payload(vec![1])])
            .expect_err("slot mismatch");
        assert!(matches!(err, SfError::InvalidConfig(_)));
    }
}
