//! W3C trace context propagation.

use std::fmt;

use rand::Rng;

/// Name of the header carrying trace context.
pub const TRACEPARENT: &str = "traceparent";

const SUPPORTED_VERSION: u8 = 0;
const FLAG_SAMPLED: u8 = 0x01;

/// The trace context of a single request.
///
/// Serialized in the `traceparent` format: `00-<32 hex trace ID>-<16 hex span ID>-<2 hex flags>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TraceContext {
    trace_id: u128,
    span_id: u64,
    flags: u8,
}

impl TraceContext {
    /// Starts a new, sampled trace.
    pub fn generate<R>(rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
    {
        Self {
            trace_id: non_zero(rng, |rng| rng.random()),
            span_id: non_zero(rng, |rng| rng.random()),
            flags: FLAG_SAMPLED,
        }
    }

    /// Parses a `traceparent` header value.
    ///
    /// Returns `None` if the value is malformed, uses an unsupported version, or carries an all-zero trace or span ID.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let (version, trace_id, span_id, flags) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);

        // Future versions may append fields, but version 00 has exactly four.
        let version = parse_hex_u8(version)?;
        if version == 0xff || (version == SUPPORTED_VERSION && parts.next().is_some()) {
            return None;
        }

        let trace_id = check_hex(trace_id, 32).and_then(|id| u128::from_str_radix(id, 16).ok());
        let span_id = check_hex(span_id, 16).and_then(|id| u64::from_str_radix(id, 16).ok());
        let trace_id = trace_id.filter(|id| *id != 0)?;
        let span_id = span_id.filter(|id| *id != 0)?;
        let flags = parse_hex_u8(flags)?;

        Some(Self {
            trace_id,
            span_id,
            flags,
        })
    }

    /// Creates the context for a new span within the same trace.
    pub fn child<R>(&self, rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
    {
        Self {
            trace_id: self.trace_id,
            span_id: non_zero(rng, |rng| rng.random()),
            flags: self.flags,
        }
    }

    /// Returns the trace ID as lowercase hex.
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    /// Returns the span ID as lowercase hex.
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{:032x}-{:016x}-{:02x}",
            SUPPORTED_VERSION, self.trace_id, self.span_id, self.flags
        )
    }
}

/// Returns `s` if it is exactly `len` lowercase hex digits.
fn check_hex(s: &str, len: usize) -> Option<&str> {
    let valid = s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    valid.then_some(s)
}

fn parse_hex_u8(s: &str) -> Option<u8> {
    check_hex(s, 2).and_then(|s| u8::from_str_radix(s, 16).ok())
}

fn non_zero<R, T, F>(rng: &mut R, mut draw: F) -> T
where
    R: Rng + ?Sized,
    T: Default + PartialEq,
    F: FnMut(&mut R) -> T,
{
    loop {
        let value = draw(rng);
        if value != T::default() {
            return value;
        }
    }
}
