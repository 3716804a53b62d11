//! Represent CA DBR payloads, as carried by reads, writes and subscription events.
//!
//! Every value moved over a circuit is one of seven basic array types
//! ([`DbrBasicType`]) with one of several categories of metadata ([`DbrCategory`])
//! attached. The client runtime only needs the plain, alarm-status and timestamped
//! categories; the graphics and control categories decode to
//! [`DbrError::Unsupported`] rather than being guessed at.
//!
//! The session layer cares about two properties of a payload beyond its value:
//! its encoded size ([`Dbr::encoded_len`]), which bounds subscription delivery
//! batches, and whether it is a fixed-size scalar ([`DbrValue::is_scalar`]), which
//! decides whether undelivered events may be collapsed to the newest one.
use nom::{
    Parser,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::NumCast;
use std::{
    fmt::{self, Display},
    io::{self, Cursor, Write},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01)
const EPICS_EPOCH_OFFSET: u64 = 631_152_000;
/// Fixed width of a CA `STRING` element
pub const MAX_STRING_SIZE: usize = 40;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DbrError {
    #[error("DBR type id {0} is not supported by this client")]
    Unsupported(u16),
    #[error("Payload too short to hold {0} element(s)")]
    Truncated(usize),
    #[error("Cannot convert {from:?} data to {to:?}")]
    NoConvert {
        from: DbrBasicType,
        to: DbrBasicType,
    },
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl DbrBasicType {
    /// Size in bytes of a single element on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Char => 1,
            DbrBasicType::Int | DbrBasicType::Enum => 2,
            DbrBasicType::Long | DbrBasicType::Float => 4,
            DbrBasicType::Double => 8,
        }
    }
}

impl TryFrom<u16> for DbrBasicType {
    type Error = DbrError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::String,
            1 => Self::Int,
            2 => Self::Float,
            3 => Self::Enum,
            4 => Self::Char,
            5 => Self::Long,
            6 => Self::Double,
            other => return Err(DbrError::Unsupported(other)),
        })
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}

impl TryFrom<u16> for DbrCategory {
    type Error = DbrError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Basic,
            1 => Self::Status,
            2 => Self::Time,
            3 => Self::Graphics,
            4 => Self::Control,
            other => return Err(DbrError::Unsupported(other)),
        })
    }
}

/// A full `DBR_<CATEGORY>_<TYPE>` identifier
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl DbrType {
    pub const fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }

    /// Bytes of metadata that precede the value array
    fn metadata_len(&self) -> usize {
        let header = match self.category {
            DbrCategory::Basic => 0,
            DbrCategory::Status => 4,
            DbrCategory::Time => 12,
            // Never encoded by this crate
            DbrCategory::Graphics | DbrCategory::Control => 0,
        };
        header + self.metadata_padding()
    }

    /// The datatype-specific padding inserted between metadata and value.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            _ => 0,
        }
    }
}

impl TryFrom<u16> for DbrType {
    type Error = DbrError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value >= 35 {
            return Err(DbrError::Unsupported(value));
        }
        Ok(Self {
            basic_type: (value % 7).try_into()?,
            category: (value / 7).try_into()?,
        })
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        value.category as u16 * 7 + value.basic_type as u16
    }
}

impl Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "STS_",
            DbrCategory::Time => "TIME_",
            DbrCategory::Graphics => "GR_",
            DbrCategory::Control => "CTRL_",
        };
        write!(f, "DBR_{category}{:?}", self.basic_type)
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let s = upper.strip_prefix("DBR_").unwrap_or(&upper);
        let (category, kind) = match s.split_once('_') {
            Some((cat, kind)) => (
                match cat {
                    "STS" => DbrCategory::Status,
                    "TIME" => DbrCategory::Time,
                    "GR" => DbrCategory::Graphics,
                    "CTRL" => DbrCategory::Control,
                    _ => return Err(()),
                },
                kind,
            ),
            None => (DbrCategory::Basic, s),
        };
        let basic_type = match kind {
            "STRING" => DbrBasicType::String,
            "INT" | "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(()),
        };
        Ok(DbrType::new(basic_type, category))
    }
}

/// Alarm status of a record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }

    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// A single fixed-width element, where a newer value fully supersedes an older
    pub fn is_scalar(&self) -> bool {
        self.get_count() <= 1
    }

    /// Number of bytes the value array occupies on the wire
    pub fn encoded_len(&self) -> usize {
        self.get_count() * self.get_type().element_size()
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrError> {
        fn cast<T: Copy + NumCast, U: NumCast>(
            from: &[T],
            err: &DbrError,
        ) -> Result<Vec<U>, DbrError> {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or_else(|| err.clone()))
                .collect()
        }
        macro_rules! numeric {
            ($variant:ident, $err:ident) => {
                match self {
                    DbrValue::Char(v) => DbrValue::$variant(cast(v, &$err)?),
                    DbrValue::Int(v) => DbrValue::$variant(cast(v, &$err)?),
                    DbrValue::Long(v) => DbrValue::$variant(cast(v, &$err)?),
                    DbrValue::Float(v) => DbrValue::$variant(cast(v, &$err)?),
                    DbrValue::Double(v) => DbrValue::$variant(cast(v, &$err)?),
                    DbrValue::Enum(v) => DbrValue::$variant(cast(&[*v], &$err)?),
                    DbrValue::String(v) => match v.as_slice() {
                        [single] => DbrValue::$variant(
                            single
                                .split_whitespace()
                                .map(|s| s.parse().map_err(|_| $err.clone()))
                                .collect::<Result<_, _>>()?,
                        ),
                        _ => return Err($err),
                    },
                }
            };
        }

        if basic_type == self.get_type() {
            return Ok(self.clone());
        }
        let err = DbrError::NoConvert {
            from: self.get_type(),
            to: basic_type,
        };
        Ok(match basic_type {
            DbrBasicType::Char => match self {
                // Strings travel as char arrays for anything longer than 40 bytes
                DbrValue::String(v) if v.len() == 1 => {
                    DbrValue::Char(v[0].bytes().map(|b| b as i8).collect())
                }
                _ => numeric!(Char, err),
            },
            DbrBasicType::Int => numeric!(Int, err),
            DbrBasicType::Long => numeric!(Long, err),
            DbrBasicType::Float => numeric!(Float, err),
            DbrBasicType::Double => numeric!(Double, err),
            DbrBasicType::String => match self {
                DbrValue::Char(v) => {
                    let bytes: Vec<u8> = v.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
                    DbrValue::String(vec![String::from_utf8_lossy(&bytes).into_owned()])
                }
                DbrValue::Int(v) => DbrValue::String(v.iter().map(|n| n.to_string()).collect()),
                DbrValue::Long(v) => DbrValue::String(v.iter().map(|n| n.to_string()).collect()),
                DbrValue::Float(v) => DbrValue::String(v.iter().map(|n| n.to_string()).collect()),
                DbrValue::Double(v) => DbrValue::String(v.iter().map(|n| n.to_string()).collect()),
                DbrValue::Enum(v) => DbrValue::String(vec![v.to_string()]),
                DbrValue::String(_) => unreachable!("handled by the same-type check"),
            },
            DbrBasicType::Enum => {
                let Ok(DbrValue::Long(converted)) = self.convert_to(DbrBasicType::Long) else {
                    return Err(err);
                };
                match converted.as_slice() {
                    [single] => DbrValue::Enum(NumCast::from(*single).ok_or(err)?),
                    _ => return Err(err),
                }
            }
        })
    }

    fn write_be<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            DbrValue::Enum(v) => writer.write_all(&v.to_be_bytes()),
            DbrValue::String(items) => {
                for item in items {
                    let mut buf = [0u8; MAX_STRING_SIZE];
                    // Keep room for the terminating null
                    let len = truncated_len(item, MAX_STRING_SIZE - 1);
                    buf[..len].copy_from_slice(&item.as_bytes()[..len]);
                    writer.write_all(&buf)?;
                }
                Ok(())
            }
            DbrValue::Char(v) => v.iter().try_for_each(|n| writer.write_all(&n.to_be_bytes())),
            DbrValue::Int(v) => v.iter().try_for_each(|n| writer.write_all(&n.to_be_bytes())),
            DbrValue::Long(v) => v.iter().try_for_each(|n| writer.write_all(&n.to_be_bytes())),
            DbrValue::Float(v) => v.iter().try_for_each(|n| writer.write_all(&n.to_be_bytes())),
            DbrValue::Double(v) => v.iter().try_for_each(|n| writer.write_all(&n.to_be_bytes())),
        }
    }

    fn decode(data_type: DbrBasicType, item_count: usize, data: &[u8]) -> Result<Self, DbrError> {
        let truncated = |_| DbrError::Truncated(item_count);
        Ok(match data_type {
            DbrBasicType::Enum => {
                DbrValue::Enum(be_u16::<_, nom::error::Error<&[u8]>>(data).map_err(truncated)?.1)
            }
            DbrBasicType::String => {
                if data.len() < item_count.saturating_sub(1) * MAX_STRING_SIZE {
                    return Err(DbrError::Truncated(item_count));
                }
                DbrValue::String(
                    data.chunks(MAX_STRING_SIZE)
                        .take(item_count)
                        .map(|d| {
                            let len = d.iter().position(|&c| c == 0).unwrap_or(d.len());
                            String::from_utf8_lossy(&d[..len]).into_owned()
                        })
                        .collect(),
                )
            }
            DbrBasicType::Char => DbrValue::Char(
                count(be_i8::<_, nom::error::Error<&[u8]>>, item_count)
                    .parse(data)
                    .map_err(truncated)?
                    .1,
            ),
            DbrBasicType::Int => DbrValue::Int(
                count(be_i16::<_, nom::error::Error<&[u8]>>, item_count)
                    .parse(data)
                    .map_err(truncated)?
                    .1,
            ),
            DbrBasicType::Long => DbrValue::Long(
                count(be_i32::<_, nom::error::Error<&[u8]>>, item_count)
                    .parse(data)
                    .map_err(truncated)?
                    .1,
            ),
            DbrBasicType::Float => DbrValue::Float(
                count(be_f32::<_, nom::error::Error<&[u8]>>, item_count)
                    .parse(data)
                    .map_err(truncated)?
                    .1,
            ),
            DbrBasicType::Double => DbrValue::Double(
                count(be_f64::<_, nom::error::Error<&[u8]>>, item_count)
                    .parse(data)
                    .map_err(truncated)?
                    .1,
            ),
        })
    }
}

/// Longest prefix of `value` that fits in `max` bytes without splitting a character
fn truncated_len(value: &str, max: usize) -> usize {
    if value.len() <= max {
        return value.len();
    }
    (0..=max).rev().find(|i| value.is_char_boundary(*i)).unwrap_or(0)
}

macro_rules! impl_dbrvalue_conversions {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = DbrError;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => unreachable!(),
                }
            }
        }
        impl TryFrom<&DbrValue> for $typ {
            type Error = DbrError;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                let values: Vec<$typ> = value.try_into()?;
                values
                    .into_iter()
                    .next()
                    .ok_or(DbrError::Truncated(1))
            }
        }
    };
}
impl_dbrvalue_conversions!(Char, i8);
impl_dbrvalue_conversions!(Int, i16);
impl_dbrvalue_conversions!(Long, i32);
impl_dbrvalue_conversions!(Float, f32);
impl_dbrvalue_conversions!(Double, f64);
impl_dbrvalue_conversions!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_string()])
    }
}

/// Elements separated by spaces, as `caget` prints them
impl Display for DbrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match self {
            DbrValue::Enum(v) => write!(f, "{v}"),
            DbrValue::String(v) => join(f, v),
            DbrValue::Char(v) => join(f, v),
            DbrValue::Int(v) => join(f, v),
            DbrValue::Long(v) => join(f, v),
            DbrValue::Float(v) => join(f, v),
            DbrValue::Double(v) => join(f, v),
        }
    }
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) | Dbr::Status { value, .. } | Dbr::Time { value, .. } => value,
        }
    }

    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) | Dbr::Status { value, .. } | Dbr::Time { value, .. } => value,
        }
    }

    /// Alarm status, if this category carries it
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } | Dbr::Time { status, .. } => Some(*status),
        }
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }

    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
        };
        DbrType::new(self.value().get_type(), category)
    }

    pub fn is_scalar(&self) -> bool {
        self.value().is_scalar()
    }

    /// Size of this DBR once serialized, excluding message header padding
    pub fn encoded_len(&self) -> usize {
        self.data_type().metadata_len() + self.value().encoded_len()
    }

    pub fn from_bytes(data_type: DbrType, data_count: usize, data: &[u8]) -> Result<Dbr, DbrError> {
        type E<'a> = nom::error::Error<&'a [u8]>;
        let truncated = |_| DbrError::Truncated(data_count);
        let (data, status) = match data_type.category {
            DbrCategory::Basic => (data, None),
            DbrCategory::Status | DbrCategory::Time => {
                let (d, (status, severity)) = (be_i16::<_, E>, be_i16::<_, E>)
                    .parse(data)
                    .map_err(truncated)?;
                (d, Some(Status { status, severity }))
            }
            DbrCategory::Graphics | DbrCategory::Control => {
                return Err(DbrError::Unsupported(data_type.into()));
            }
        };
        let (data, timestamp) = if data_type.category == DbrCategory::Time {
            let (d, (secs, nanos)) = (be_u32::<_, E>, be_u32::<_, E>)
                .parse(data)
                .map_err(truncated)?;
            let since_unix = Duration::new(secs as u64 + EPICS_EPOCH_OFFSET, nanos);
            (d, Some(UNIX_EPOCH + since_unix))
        } else {
            (data, None)
        };
        let data = data
            .get(data_type.metadata_padding()..)
            .ok_or(DbrError::Truncated(data_count))?;
        let value = DbrValue::decode(data_type.basic_type, data_count, data)?;

        Ok(match (status, timestamp) {
            (Some(status), Some(timestamp)) => Dbr::Time {
                status,
                timestamp,
                value,
            },
            (Some(status), None) => Dbr::Status { status, value },
            _ => Dbr::Basic(value),
        })
    }

    /// Serialize, returning the element count along with the bytes
    pub fn to_bytes(&self) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::with_capacity(self.encoded_len()));
        // Writing into a Vec cannot fail
        let _ = self.write_be(&mut buffer);
        (self.value().get_count(), buffer.into_inner())
    }

    fn write_be<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        if let Dbr::Time { timestamp, .. } = self {
            let since_unix = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
            let secs = since_unix.as_secs().saturating_sub(EPICS_EPOCH_OFFSET) as u32;
            writer.write_all(&secs.to_be_bytes())?;
            writer.write_all(&since_unix.subsec_nanos().to_be_bytes())?;
        }
        writer.write_all(&vec![0u8; self.data_type().metadata_padding()])?;
        self.value().write_be(writer)
    }

    /// Change the value type and metadata category, keeping whatever metadata survives
    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, DbrError> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let status = self.status().unwrap_or_default();
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp().unwrap_or_else(SystemTime::now),
                value,
            },
            DbrCategory::Graphics | DbrCategory::Control => {
                return Err(DbrError::Unsupported(dbr_type.into()));
            }
        })
    }
}
