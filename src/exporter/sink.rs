use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::window::WindowRecord;

/// Why a delivery did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Worth retrying: network trouble, unavailability, throttling
    #[error("transient sink error: {0}")]
    Transient(String),

    /// The sink refused the record; retrying cannot help
    #[error("permanent sink error: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Outcome for one record of a batch
pub type ItemResult = std::result::Result<(), SinkError>;

/// Destination of window records
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Deliver a batch
    ///
    /// `Err` means the whole batch failed alike; `Ok` carries one result per
    /// record, in order.
    async fn deliver(&self, records: &[Arc<WindowRecord>]) -> std::result::Result<Vec<ItemResult>, SinkError>;
}

/// Keeps delivered records in memory, keyed by record id
///
/// Redelivery of a record overwrites the earlier copy, like an indexing
/// sink would.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    records: Mutex<BTreeMap<Uuid, Arc<WindowRecord>>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Stored records, ordered by series and window
    pub fn records(&self) -> Vec<Arc<WindowRecord>> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| (&a.key, a.window.start).cmp(&(&b.key, b.window.start)));
        records
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<WindowRecord>> {
        self.records.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, records: &[Arc<WindowRecord>]) -> std::result::Result<Vec<ItemResult>, SinkError> {
        let mut stored = self.records.lock();
        for record in records {
            stored.insert(record.id, Arc::clone(record));
        }
        Ok(vec![Ok(()); records.len()])
    }
}
