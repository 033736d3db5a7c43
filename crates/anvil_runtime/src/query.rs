//! # Query Pools
//!
//! A pool is a fixed array of slots of one [`QueryType`], created against a
//! queue. `BeginQuery` and `EndQuery` commands bracket a region of a command
//! buffer; the results are read back on the host once the dispatch has
//! completed.
//!
//! - **Duration** slots hold host-clock `(start, end)` nanosecond pairs.
//! - **Counter** slots measure one counter each (slot `i` measures the
//!   `i`-th configured counter) as the change of the queue's running total
//!   between begin and end.
//!
//! Counters the device can sample at once are limited; a configuration
//! needing more hardware counters than that must be replayed over several
//! passes, see [`required_passes`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anvil_core::{
    CounterDescription, CounterKind, CounterStorage, DeviceInfo, HalError, HalResult, HostCharge,
    ObjectId,
};
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

/// Kind of a query pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Host-clock durations.
    Duration,
    /// Queue counters.
    Counter,
}

/// A typed counter value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    /// Signed 32-bit.
    Int32(i32),
    /// Signed 64-bit.
    Int64(i64),
    /// Unsigned 32-bit.
    Uint32(u32),
    /// Unsigned 64-bit.
    Uint64(u64),
    /// 32-bit float.
    Float32(f32),
    /// 64-bit float.
    Float64(f64),
}

impl CounterValue {
    fn from_raw(kind: CounterKind, storage: CounterStorage, raw: u64) -> Self {
        // busy time is sampled in nanoseconds and reported in milliseconds
        let value = if kind == CounterKind::BusyTime {
            raw as f64 / 1_000_000.0
        } else {
            raw as f64
        };
        match storage {
            CounterStorage::Int32 => Self::Int32(value as i32),
            CounterStorage::Int64 => Self::Int64(value as i64),
            CounterStorage::Uint32 => Self::Uint32(value as u32),
            CounterStorage::Uint64 => Self::Uint64(value as u64),
            CounterStorage::Float32 => Self::Float32(value as f32),
            CounterStorage::Float64 => Self::Float64(value),
        }
    }

    /// Storage type of the value.
    #[must_use]
    pub const fn storage(&self) -> CounterStorage {
        match self {
            Self::Int32(_) => CounterStorage::Int32,
            Self::Int64(_) => CounterStorage::Int64,
            Self::Uint32(_) => CounterStorage::Uint32,
            Self::Uint64(_) => CounterStorage::Uint64,
            Self::Float32(_) => CounterStorage::Float32,
            Self::Float64(_) => CounterStorage::Float64,
        }
    }

    /// The value widened to 64 bits, floats as their bit pattern.
    #[must_use]
    pub fn to_bits(&self) -> u64 {
        match *self {
            Self::Int32(v) => v as i64 as u64,
            Self::Int64(v) => v as u64,
            Self::Uint32(v) => u64::from(v),
            Self::Uint64(v) => v,
            Self::Float32(v) => u64::from(v.to_bits()),
            Self::Float64(v) => v.to_bits(),
        }
    }

    /// The value as a float, for display and comparisons.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Int32(v) => f64::from(v),
            Self::Int64(v) => v as f64,
            Self::Uint32(v) => f64::from(v),
            Self::Uint64(v) => v as f64,
            Self::Float32(v) => f64::from(v),
            Self::Float64(v) => v,
        }
    }
}

/// One slot's result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum QueryResult {
    /// Host-clock nanoseconds at begin and end. Zero until written.
    Duration {
        /// Begin timestamp.
        start_ns: u64,
        /// End timestamp.
        end_ns: u64,
    },
    /// Counter change between begin and end.
    Counter {
        /// Counter measured.
        uuid: u32,
        /// Change in the counter.
        value: CounterValue,
    },
}

/// Byte layout of a duration result.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct DurationRecord {
    /// Begin timestamp in nanoseconds.
    pub start_ns: u64,
    /// End timestamp in nanoseconds.
    pub end_ns: u64,
}

/// Byte layout of a counter result.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct CounterRecord {
    /// Counter uuid.
    pub uuid: u32,
    /// Storage tag, the index of the storage type in declaration order.
    pub storage: u32,
    /// Value bits, see [`CounterValue::to_bits`].
    pub value: u64,
}

/// Bytes each encoded result occupies.
pub const QUERY_RESULT_SIZE: usize = 16;

impl QueryResult {
    fn encode(&self) -> [u8; QUERY_RESULT_SIZE] {
        match *self {
            Self::Duration { start_ns, end_ns } => {
                bytemuck::cast(DurationRecord { start_ns, end_ns })
            }
            Self::Counter { uuid, value } => bytemuck::cast(CounterRecord {
                uuid,
                storage: storage_tag(value.storage()),
                value: value.to_bits(),
            }),
        }
    }
}

const fn storage_tag(storage: CounterStorage) -> u32 {
    match storage {
        CounterStorage::Int32 => 0,
        CounterStorage::Int64 => 1,
        CounterStorage::Uint32 => 2,
        CounterStorage::Uint64 => 3,
        CounterStorage::Float32 => 4,
        CounterStorage::Float64 => 5,
    }
}

/// Running totals of one queue, sampled by counter queries.
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    commands: AtomicU64,
    bytes_transferred: AtomicU64,
    work_items: AtomicU64,
    kernel_launches: AtomicU64,
    busy_ns: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn record_command(&self, busy_ns: u64) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.busy_ns.fetch_add(busy_ns, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_launch(&self, work_items: u64) {
        self.kernel_launches.fetch_add(1, Ordering::Relaxed);
        self.work_items.fetch_add(work_items, Ordering::Relaxed);
    }

    pub(crate) fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    fn sample(&self, kind: CounterKind) -> u64 {
        let counter = match kind {
            CounterKind::Commands => &self.commands,
            CounterKind::BytesTransferred => &self.bytes_transferred,
            CounterKind::WorkItems => &self.work_items,
            CounterKind::KernelLaunches => &self.kernel_launches,
            CounterKind::BusyTime => &self.busy_ns,
        };
        counter.load(Ordering::Relaxed)
    }
}

/// Number of passes needed to sample `counter_uuids`: `ceil(n / m)` for `n`
/// hardware counters used and `m` sampleable at once.
///
/// # Errors
///
/// - [`HalError::FeatureUnsupported`] if the device samples no counters
/// - [`HalError::InvalidValue`] for an empty list or an unknown uuid
pub fn required_passes(info: &DeviceInfo, counter_uuids: &[u32]) -> HalResult<u32> {
    let per_pass = info.capabilities.max_hardware_counters;
    if per_pass == 0 {
        return Err(HalError::FeatureUnsupported("hardware counters"));
    }
    let counters = resolve_counters(info, counter_uuids)?;
    if counters.is_empty() {
        return Err(HalError::invalid("no counters requested"));
    }
    let used: u32 = counters.iter().map(|counter| counter.hardware_counters).sum();
    Ok(used.div_ceil(per_pass))
}

fn resolve_counters(info: &DeviceInfo, counter_uuids: &[u32]) -> HalResult<Vec<CounterDescription>> {
    counter_uuids
        .iter()
        .map(|&uuid| {
            info.counter(uuid)
                .cloned()
                .ok_or_else(|| HalError::invalid(format!("unknown counter uuid {uuid}")))
        })
        .collect()
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as u64)
}

#[derive(Clone, Copy, Debug, Default)]
struct QuerySlot {
    /// Timestamp or counter sample taken at begin.
    begin: Option<u64>,
    result: Option<QueryResult>,
}

#[derive(Debug)]
pub(crate) struct QueryPoolShared {
    id: ObjectId,
    queue: ObjectId,
    query_type: QueryType,
    counters: Vec<CounterDescription>,
    slots: Mutex<Vec<QuerySlot>>,
}

impl QueryPoolShared {
    pub(crate) fn check_range(&self, index: u32, count: u32) -> HalResult<()> {
        let len = self.slots.lock().len();
        let end = index as usize + count as usize;
        if count == 0 || end > len {
            return Err(HalError::invalid(format!(
                "query range {index}+{count} outside pool {} of {len} slots",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn begin(&self, index: u32, count: u32, counters: &QueueCounters) {
        let now = now_ns();
        let mut slots = self.slots.lock();
        for slot_index in index as usize..(index + count) as usize {
            let begin = match self.query_type {
                QueryType::Duration => now,
                QueryType::Counter => counters.sample(self.counters[slot_index].kind),
            };
            slots[slot_index] = QuerySlot {
                begin: Some(begin),
                result: None,
            };
        }
    }

    pub(crate) fn end(&self, index: u32, count: u32, counters: &QueueCounters) -> HalResult<()> {
        let now = now_ns();
        let mut slots = self.slots.lock();
        for slot_index in index as usize..(index + count) as usize {
            let slot = &mut slots[slot_index];
            let begin = slot.begin.ok_or_else(|| {
                HalError::Failure(format!("query slot {slot_index} ended before it began"))
            })?;
            slot.result = Some(match self.query_type {
                QueryType::Duration => QueryResult::Duration {
                    start_ns: begin,
                    end_ns: now,
                },
                QueryType::Counter => {
                    let counter = &self.counters[slot_index];
                    let delta = counters.sample(counter.kind).saturating_sub(begin);
                    QueryResult::Counter {
                        uuid: counter.uuid,
                        value: CounterValue::from_raw(counter.kind, counter.storage, delta),
                    }
                }
            });
        }
        Ok(())
    }

    pub(crate) fn reset(&self, index: u32, count: u32) {
        let mut slots = self.slots.lock();
        for slot in &mut slots[index as usize..(index + count) as usize] {
            *slot = QuerySlot::default();
        }
    }

    pub(crate) fn results(&self, queue: ObjectId, start: u32, count: u32) -> HalResult<Vec<QueryResult>> {
        if queue != self.queue {
            return Err(HalError::invalid(format!(
                "query pool {} was created for queue {}, not {queue}",
                self.id, self.queue
            )));
        }
        self.check_range(start, count)?;
        let slots = self.slots.lock();
        Ok((start as usize..(start + count) as usize)
            .map(|index| {
                slots[index].result.unwrap_or_else(|| self.unwritten(index))
            })
            .collect())
    }

    fn unwritten(&self, index: usize) -> QueryResult {
        match self.query_type {
            QueryType::Duration => QueryResult::Duration {
                start_ns: 0,
                end_ns: 0,
            },
            QueryType::Counter => {
                let counter = &self.counters[index];
                QueryResult::Counter {
                    uuid: counter.uuid,
                    value: CounterValue::from_raw(counter.kind, counter.storage, 0),
                }
            }
        }
    }
}

/// Encodes results into `out`, one every `stride` bytes.
pub(crate) fn encode_results(results: &[QueryResult], stride: usize, out: &mut [u8]) -> HalResult<()> {
    if stride < QUERY_RESULT_SIZE {
        return Err(HalError::invalid(format!(
            "stride {stride} is smaller than a result ({QUERY_RESULT_SIZE} bytes)"
        )));
    }
    let out_len = out.len();
    let too_small = || {
        HalError::invalid(format!(
            "output of {out_len} bytes cannot hold {} results at stride {stride}",
            results.len()
        ))
    };
    let mut records = Vec::with_capacity(results.len());
    for (index, result) in results.iter().enumerate() {
        let start = index.checked_mul(stride).ok_or_else(too_small)?;
        let end = start.checked_add(QUERY_RESULT_SIZE).ok_or_else(too_small)?;
        if end > out_len {
            return Err(too_small());
        }
        records.push((start..end, result.encode()));
    }
    for (range, record) in records {
        out[range].copy_from_slice(&record);
    }
    Ok(())
}

/// A query pool.
#[derive(Debug)]
pub struct QueryPool {
    shared: Arc<QueryPoolShared>,
    device: ObjectId,
    _charge: HostCharge,
}

impl QueryPool {
    pub(crate) fn new(
        id: ObjectId,
        device: ObjectId,
        queue: ObjectId,
        info: &DeviceInfo,
        query_type: QueryType,
        slot_count: u32,
        counter_uuids: &[u32],
        charge: HostCharge,
    ) -> HalResult<Self> {
        if slot_count == 0 {
            return Err(HalError::invalid("a query pool needs at least one slot"));
        }
        let counters = match query_type {
            QueryType::Duration => Vec::new(),
            QueryType::Counter => {
                required_passes(info, counter_uuids)?;
                if counter_uuids.len() != slot_count as usize {
                    return Err(HalError::invalid(format!(
                        "{} counters configured for {slot_count} slots",
                        counter_uuids.len()
                    )));
                }
                resolve_counters(info, counter_uuids)?
            }
        };
        Ok(Self {
            shared: Arc::new(QueryPoolShared {
                id,
                queue,
                query_type,
                counters,
                slots: Mutex::new(vec![QuerySlot::default(); slot_count as usize]),
            }),
            device,
            _charge: charge,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<QueryPoolShared> {
        &self.shared
    }

    /// Object id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.shared.id
    }

    /// Id of the owning device.
    #[must_use]
    pub fn device_id(&self) -> ObjectId {
        self.device
    }

    /// Queue the pool was created for.
    #[must_use]
    pub fn queue_id(&self) -> ObjectId {
        self.shared.queue
    }

    /// Pool type.
    #[must_use]
    pub fn query_type(&self) -> QueryType {
        self.shared.query_type
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.slots.lock().len()
    }

    /// Always false; pools have at least one slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters measured by a counter pool, one per slot.
    #[must_use]
    pub fn counters(&self) -> &[CounterDescription] {
        &self.shared.counters
    }
}
