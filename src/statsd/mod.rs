//! The statsd wire grammar: typed samples decoded from newline-delimited
//! UDP payloads.

use tokio::sync::mpsc;

/// Name prefix marking a counter for leaf forwarding.
pub const FORWARD_PREFIX: &[u8] = b"f|";

/// The kind of a decoded statsd sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    Counter,
    Gauge,
    Timer,
    Set,
}

impl StatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Timer => "timer",
            Self::Set => "set",
        }
    }
}

/// A single decoded sample. Stats own their name; nothing borrows from the
/// receive buffer once parsing returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub kind: StatKind,
    pub name: String,
    pub value: f64,
    /// Sampling correction divisor, counters only. Always in (0, 1].
    pub sample_rate: f64,
    /// Set by the `f|` name prefix. Only meaningful on counters; the
    /// classifier rejects it elsewhere.
    pub forward: bool,
}

/// Parses one statsd message: `<name>:<value>|<type>[|@<sample_rate>]`.
///
/// Type tags are `c`, `g`, `ms` and `s`. A sample rate is only accepted on
/// counters and must be in (0, 1]. Returns `None` for anything malformed;
/// the caller decides how to account for the drop.
pub fn parse_line(line: &[u8]) -> Option<Stat> {
    let (line, forward) = match line.strip_prefix(FORWARD_PREFIX) {
        Some(rest) => (rest, true),
        None => (line, false),
    };

    let colon = line.iter().position(|&b| b == b':')?;
    let (name, rest) = line.split_at(colon);
    if name.is_empty() {
        return None;
    }
    let rest = &rest[1..];

    let pipe = rest.iter().position(|&b| b == b'|')?;
    let value: f64 = std::str::from_utf8(&rest[..pipe]).ok()?.parse().ok()?;
    let rest = &rest[pipe + 1..];

    let (tag, sampling) = match rest.iter().position(|&b| b == b'|') {
        Some(p) => (&rest[..p], Some(&rest[p + 1..])),
        None => (rest, None),
    };

    let kind = match tag {
        b"c" => StatKind::Counter,
        b"g" => StatKind::Gauge,
        b"ms" => StatKind::Timer,
        b"s" => StatKind::Set,
        _ => return None,
    };

    let sample_rate = match sampling {
        Some(raw) => {
            let raw = raw.strip_prefix(b"@")?;
            if kind != StatKind::Counter {
                return None;
            }
            let rate: f64 = std::str::from_utf8(raw).ok()?.parse().ok()?;
            if !(rate > 0.0 && rate <= 1.0) {
                return None;
            }
            rate
        }
        None => 1.0,
    };

    let name = std::str::from_utf8(name).ok()?.to_owned();

    Some(Stat {
        kind,
        name,
        value,
        sample_rate,
        forward,
    })
}

/// Submits internally generated counters ("meta-stats") such as
/// `packets_received` and the `errors.*` family into the main aggregation
/// queue, where they flow like any other counter.
#[derive(Clone)]
pub struct MetaSender {
    tx: mpsc::Sender<Stat>,
}

impl MetaSender {
    pub fn new(tx: mpsc::Sender<Stat>) -> Self {
        Self { tx }
    }

    /// Increments the named counter by one. A send error means the main
    /// aggregator is gone (shutdown) and is ignored.
    pub async fn inc(&self, name: &str) {
        let stat = Stat {
            kind: StatKind::Counter,
            name: name.to_owned(),
            value: 1.0,
            sample_rate: 1.0,
            forward: false,
        };
        let _ = self.tx.send(stat).await;
    }
}
