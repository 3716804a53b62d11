//! An explicit registration table of PVs, for serving values over CA.
//!
//! A [`PvGroup`] is built once, up front, from named entries each holding an initial
//! value (which fixes the native type and element count) and a [`PvAccessor`] that
//! decides what reads and writes do. The table keeps registration order.
//!
//! ```
//! use casession::pvgroup::{PvGroupBuilder, ReadOnly};
//!
//! let group = PvGroupBuilder::new("BL99P-EA-TEST-01:")
//!     .add("SETPOINT", 3.5f64)
//!     .add_with("SERIAL", "SN-0042", ReadOnly)
//!     .build()
//!     .unwrap();
//! assert!(group.contains("BL99P-EA-TEST-01:SETPOINT"));
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue, Status},
    messages::ErrorCondition,
};

/// What an accessor gets to see about the PV being accessed
#[derive(Debug)]
pub struct PvContext<'a> {
    pub name: &'a str,
    pub native_type: DbrBasicType,
    /// The currently stored value
    pub current: &'a DbrValue,
}

/// Read and write behaviour for one PV.
///
/// The defaults store and return the value unchanged. Whatever `put` returns is
/// converted to the PV's native type and stored.
pub trait PvAccessor: Send + Sync {
    fn get(&self, context: &PvContext<'_>) -> Result<DbrValue, ErrorCondition> {
        Ok(context.current.clone())
    }

    #[allow(unused_variables)]
    fn put(&self, context: &PvContext<'_>, value: DbrValue) -> Result<DbrValue, ErrorCondition> {
        Ok(value)
    }
}

/// Plain storage
#[derive(Debug, Default, Copy, Clone)]
pub struct Stored;
impl PvAccessor for Stored {}

/// Rejects every client write
#[derive(Debug, Default, Copy, Clone)]
pub struct ReadOnly;
impl PvAccessor for ReadOnly {
    fn put(&self, _context: &PvContext<'_>, _value: DbrValue) -> Result<DbrValue, ErrorCondition> {
        Err(ErrorCondition::NoWtAccess)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PvGroupError {
    #[error("PV {0} is registered more than once")]
    Duplicate(String),
    #[error("PV {0} needs an initial value with at least one element")]
    Empty(String),
}

struct PvEntry {
    name: String,
    native_type: DbrBasicType,
    accessor: Box<dyn PvAccessor>,
    state: Mutex<(DbrValue, SystemTime)>,
    /// Every stored value, for monitors
    updates: broadcast::Sender<Dbr>,
}

impl PvEntry {
    fn load(&self) -> (DbrValue, SystemTime) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, value: &DbrValue) -> Result<(), ErrorCondition> {
        let value = value
            .convert_to(self.native_type)
            .map_err(|_| ErrorCondition::NoConvert)?;
        let timestamp = SystemTime::now();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = (value.clone(), timestamp);
        let _ = self.updates.send(Dbr::Time {
            status: Status::default(),
            timestamp,
            value,
        });
        Ok(())
    }
}

pub struct PvGroupBuilder {
    /// Inserted in front of every PV name
    prefix: String,
    entries: Vec<(String, DbrValue, Box<dyn PvAccessor>)>,
}

impl PvGroupBuilder {
    pub fn new(prefix: &str) -> Self {
        PvGroupBuilder {
            prefix: prefix.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn add(self, name: &str, initial: impl Into<DbrValue>) -> Self {
        self.add_with(name, initial, Stored)
    }

    pub fn add_with(
        mut self,
        name: &str,
        initial: impl Into<DbrValue>,
        accessor: impl PvAccessor + 'static,
    ) -> Self {
        self.entries.push((
            format!("{}{name}", self.prefix),
            initial.into(),
            Box::new(accessor),
        ));
        self
    }

    pub fn build(self) -> Result<PvGroup, PvGroupError> {
        let mut index = HashMap::new();
        let mut pvs = Vec::with_capacity(self.entries.len());
        for (name, initial, accessor) in self.entries {
            if initial.get_count() == 0 {
                return Err(PvGroupError::Empty(name));
            }
            if index.insert(name.clone(), pvs.len()).is_some() {
                return Err(PvGroupError::Duplicate(name));
            }
            debug!("Registering PV {name} as {:?}", initial.get_type());
            pvs.push(PvEntry {
                name,
                native_type: initial.get_type(),
                accessor,
                state: Mutex::new((initial, SystemTime::now())),
                updates: broadcast::Sender::new(64),
            });
        }
        Ok(PvGroup {
            inner: Arc::new(PvGroupInner { pvs, index }),
        })
    }
}

struct PvGroupInner {
    pvs: Vec<PvEntry>,
    index: HashMap<String, usize>,
}

/// A fixed set of PVs, shareable across threads
#[derive(Clone)]
pub struct PvGroup {
    inner: Arc<PvGroupInner>,
}

impl std::fmt::Debug for PvGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl PvGroup {
    fn entry(&self, name: &str) -> Result<&PvEntry, ErrorCondition> {
        self.inner
            .index
            .get(name)
            .map(|i| &self.inner.pvs[*i])
            .ok_or(ErrorCondition::BadChId)
    }

    /// PV names, in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.pvs.iter().map(|pv| pv.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.index.contains_key(name)
    }

    /// Native type and element count
    pub fn native(&self, name: &str) -> Option<(DbrBasicType, usize)> {
        let pv = self.entry(name).ok()?;
        Some((pv.native_type, pv.load().0.get_count()))
    }

    /// Read through the accessor, with timestamp and alarm status
    pub fn read(&self, name: &str) -> Result<Dbr, ErrorCondition> {
        let pv = self.entry(name)?;
        let (current, timestamp) = pv.load();
        let value = pv.accessor.get(&PvContext {
            name,
            native_type: pv.native_type,
            current: &current,
        })?;
        Ok(Dbr::Time {
            status: Status::default(),
            timestamp,
            value,
        })
    }

    /// Read converted to the requested type
    pub fn read_as(&self, name: &str, data_type: DbrType) -> Result<Dbr, ErrorCondition> {
        self.read(name)?
            .convert_to(data_type)
            .map_err(|_| ErrorCondition::NoConvert)
    }

    /// A client write: goes through the accessor, then is stored as the native type
    pub fn write(&self, name: &str, value: &Dbr) -> Result<(), ErrorCondition> {
        let pv = self.entry(name)?;
        let (current, _) = pv.load();
        let accepted = pv.accessor.put(
            &PvContext {
                name,
                native_type: pv.native_type,
                current: &current,
            },
            value.value().clone(),
        )?;
        pv.store(&accepted)
    }

    /// Update a value from the serving side, bypassing the accessor
    pub fn store(&self, name: &str, value: impl Into<DbrValue>) -> Result<(), ErrorCondition> {
        self.entry(name)?.store(&value.into())
    }

    /// Receive every value stored from now on
    pub fn subscribe(&self, name: &str) -> Option<broadcast::Receiver<Dbr>> {
        self.entry(name).ok().map(|pv| pv.updates.subscribe())
    }
}
