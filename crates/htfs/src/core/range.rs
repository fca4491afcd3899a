use crate::error::{Error, Result};

/// A half-open byte range `[start, end)`; `end == None` runs to the end of
/// the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// The `Range` request header value.
    ///
    /// # Examples
    ///
    /// ```
    /// use htfs::core::ByteRange;
    ///
    /// assert_eq!(ByteRange::from(512).header_value(), "bytes=512-");
    /// assert_eq!(ByteRange::bounded(0, 1024).header_value(), "bytes=0-1023");
    /// ```
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) if end > self.start => format!("bytes={}-{}", self.start, end - 1),
            _ => format!("bytes={}-", self.start),
        }
    }
}

/// A parsed `Content-Range` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First and last byte (inclusive), absent for `bytes */N`.
    pub span: Option<(u64, u64)>,
    /// Complete length, absent for `bytes a-b/*`.
    pub total: Option<u64>,
}

impl ContentRange {
    /// Whether a `206` carrying this header answers `range` exactly.
    ///
    /// A range reaching past the complete length only has to run to its end.
    ///
    /// # Examples
    ///
    /// ```
    /// use htfs::core::{ByteRange, parse_content_range};
    ///
    /// let served = parse_content_range("bytes 100-199/1000").unwrap();
    /// assert!(served.covers(&ByteRange::bounded(100, 200)));
    /// assert!(!served.covers(&ByteRange::bounded(100, 300)));
    /// ```
    pub fn covers(&self, range: &ByteRange) -> bool {
        let Some((first, last)) = self.span else {
            return false;
        };
        if first != range.start {
            return false;
        }
        let wanted = range.end.filter(|&end| end > range.start);
        let end = match (wanted, self.total) {
            (Some(end), Some(total)) => end.min(total),
            (Some(end), None) => end,
            (None, Some(total)) => total,
            (None, None) => return true,
        };
        last.checked_add(1) == Some(end)
    }
}

/// Parse a `Content-Range` header such as `bytes 0-499/1234` or `bytes */1234`.
pub fn parse_content_range(value: &str) -> Result<ContentRange> {
    let malformed = || Error::Malformed(format!("bad Content-Range: {value:?}"));

    let rest = value.trim().strip_prefix("bytes").ok_or_else(malformed)?;
    let (span, total) = rest.trim_start().split_once('/').ok_or_else(malformed)?;

    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| malformed())?),
    };

    let span = match span.trim() {
        "*" => None,
        s => {
            let (first, last) = s.split_once('-').ok_or_else(malformed)?;
            let first = first.trim().parse::<u64>().map_err(|_| malformed())?;
            let last = last.trim().parse::<u64>().map_err(|_| malformed())?;
            if last < first {
                return Err(malformed());
            }
            Some((first, last))
        }
    };

    if span.is_none() && total.is_none() {
        return Err(malformed());
    }

    Ok(ContentRange { span, total })
}

/// How many bytes a connection at `cursor` must drop to reach `offset`, or
/// `None` when it cannot serve `offset` at all.
///
/// A connection only moves forward: anything behind its cursor, at or past
/// its end, or further ahead than `max_skip` needs a new request.
///
/// # Examples
///
/// ```
/// use htfs::core::skip_distance;
///
/// assert_eq!(skip_distance(100, 1000, 100, 64), Some(0));
/// assert_eq!(skip_distance(100, 1000, 150, 64), Some(50));
/// assert_eq!(skip_distance(100, 1000, 99, 64), None);
/// assert_eq!(skip_distance(100, 1000, 200, 64), None);
/// ```
pub fn skip_distance(cursor: u64, end: u64, offset: u64, max_skip: u64) -> Option<u64> {
    if offset < cursor || offset >= end {
        return None;
    }
    let skip = offset - cursor;
    (skip <= max_skip).then_some(skip)
}

/// End (exclusive) of the range to request for a read starting at `offset`.
pub fn request_end(offset: u64, size: u64, max_len: Option<u64>) -> u64 {
    match max_len {
        Some(len) => offset.saturating_add(len).min(size),
        None => size,
    }
}
