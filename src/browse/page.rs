//! Opaque page cursors.
//!
//! A cursor is a `;`-separated list of single-letter `key=value` pairs:
//! `m` (mode, always present), `d` (packed start timestamp), `o` (offset),
//! `s` (page size) and `r` (reversed). Optional keys are only written when
//! they differ from their defaults, so the first page of a listing encodes
//! as just `m=<mode>`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use time::macros::datetime;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 20;
/// Largest offset a cursor may carry; it binds as a SQLite integer.
pub const MAX_PAGE_OFFSET: usize = i32::MAX as usize;

const PACKED_DATE_LEN: usize = 17;
// The packed year field holds three hex digits.
const EARLIEST_START: OffsetDateTime = datetime!(0000-01-01 0:00 UTC);
const LATEST_START: OffsetDateTime = datetime!(4095-12-31 23:59:59.999_999 UTC);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageFormatError {
    #[error("page cursor is empty")]
    Empty,
    #[error("page cursor has no mode")]
    MissingMode,
    #[error("malformed page parameter {0:?}")]
    MalformedParam(String),
    #[error("unknown page parameter {0:?}")]
    UnknownKey(String),
    #[error("packed date must be {PACKED_DATE_LEN} hex digits, got {0:?}")]
    DateLength(String),
    #[error("packed date {0:?} is not a valid timestamp")]
    InvalidDate(String),
    #[error("page parameter {key} expects a number, got {value:?}")]
    NotNumeric { key: char, value: String },
    #[error("page offset {0} is larger than {MAX_PAGE_OFFSET}")]
    OffsetOutOfRange(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpecifier {
    mode: String,
    start_value: Option<OffsetDateTime>,
    offset: usize,
    size: usize,
    reversed: bool,
}

impl PageSpecifier {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            start_value: None,
            offset: 0,
            size: DEFAULT_PAGE_SIZE,
            reversed: false,
        }
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn start_value(&self) -> Option<OffsetDateTime> {
        self.start_value
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn reversed(&self) -> bool {
        self.reversed
    }

    /// The start value is kept in UTC at microsecond precision, clamped to
    /// the years a cursor can carry.
    pub fn with_start_value(mut self, start_value: Option<OffsetDateTime>) -> Self {
        self.start_value = start_value.map(|value| {
            let value = value
                .to_offset(UtcOffset::UTC)
                .clamp(EARLIEST_START, LATEST_START);
            value.replace_microsecond(value.microsecond()).unwrap_or(value)
        });
        self
    }

    /// Offsets above [`MAX_PAGE_OFFSET`] are clamped.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset.min(MAX_PAGE_OFFSET);
        self
    }

    /// Sizes outside `1..=MAX_PAGE_SIZE` are clamped.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_reversed(mut self, reversed: bool) -> Self {
        self.reversed = reversed;
        self
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(encoded: &str) -> Result<Self, PageFormatError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(PageFormatError::Empty);
        }

        let mut mode = None;
        let mut spec = PageSpecifier::new(String::new());
        for param in encoded.split(';').filter(|param| !param.is_empty()) {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| PageFormatError::MalformedParam(param.to_string()))?;
            match key {
                "m" if !value.is_empty() => mode = Some(value.to_string()),
                "m" => return Err(PageFormatError::MissingMode),
                "d" => spec.start_value = Some(decode_date_time(value)?),
                "o" => spec.offset = parse_offset(value)?,
                "s" => spec = spec.with_size(parse_number('s', value)?),
                "r" => spec.reversed = parse_number::<u8>('r', value)? != 0,
                _ => return Err(PageFormatError::UnknownKey(key.to_string())),
            }
        }
        spec.mode = mode.ok_or(PageFormatError::MissingMode)?;
        tracing::debug!(cursor = encoded, ?spec, "decoded page cursor");
        Ok(spec)
    }
}

impl fmt::Display for PageSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={}", self.mode)?;
        if let Some(start) = self.start_value {
            write!(f, ";d={}", encode_date_time(start))?;
        }
        if self.offset != 0 {
            write!(f, ";o={}", self.offset)?;
        }
        if self.size != DEFAULT_PAGE_SIZE {
            write!(f, ";s={}", self.size)?;
        }
        if self.reversed {
            f.write_str(";r=1")?;
        }
        Ok(())
    }
}

impl FromStr for PageSpecifier {
    type Err = PageFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

fn parse_number<T: FromStr>(key: char, value: &str) -> Result<T, PageFormatError> {
    value.parse().map_err(|_| PageFormatError::NotNumeric {
        key,
        value: value.to_string(),
    })
}

fn parse_offset(value: &str) -> Result<usize, PageFormatError> {
    let offset: u64 = parse_number('o', value)?;
    usize::try_from(offset)
        .ok()
        .filter(|offset| *offset <= MAX_PAGE_OFFSET)
        .ok_or(PageFormatError::OffsetOutOfRange(offset))
}

/// Packs a UTC timestamp into 17 hex digits: year (3), month (1), day (2),
/// hour (2), minute (2), second (2), microsecond (5).
///
/// Only years 0 through 4095 fit the year field.
pub fn encode_date_time(value: OffsetDateTime) -> String {
    let value = value.to_offset(UtcOffset::UTC);
    format!(
        "{:03x}{:x}{:02x}{:02x}{:02x}{:02x}{:05x}",
        value.year(),
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute(),
        value.second(),
        value.microsecond(),
    )
}

pub fn decode_date_time(packed: &str) -> Result<OffsetDateTime, PageFormatError> {
    if packed.len() != PACKED_DATE_LEN || !packed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PageFormatError::DateLength(packed.to_string()));
    }
    let invalid = || PageFormatError::InvalidDate(packed.to_string());
    let field = |range: std::ops::Range<usize>| {
        u32::from_str_radix(&packed[range], 16).map_err(|_| invalid())
    };

    let year = field(0..3)? as i32;
    let month = Month::try_from(field(3..4)? as u8).map_err(|_| invalid())?;
    let day = field(4..6)? as u8;
    let date = Date::from_calendar_date(year, month, day).map_err(|_| invalid())?;
    let time = Time::from_hms_micro(
        field(6..8)? as u8,
        field(8..10)? as u8,
        field(10..12)? as u8,
        field(12..17)?,
    )
    .map_err(|_| invalid())?;
    Ok(PrimitiveDateTime::new(date, time).assume_utc())
}
