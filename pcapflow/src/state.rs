use chrono::{DateTime, SecondsFormat};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::capture::RawPacket;
use crate::classify::{Classification, Protocol};
use crate::storage::WriteOutcome;

/// Normalized per-packet document, as sent to the document store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketRecord {
    pub timestamp: f64,
    #[serde(rename = "@timestamp")]
    pub observed_at: String,
    pub packet_length: u64,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub l4_protocol: Protocol,
}

impl PacketRecord {
    /// Combine a raw packet with its classification.
    ///
    /// `packet_length` is the wire length, which may exceed the captured
    /// bytes when the capture used a short snaplen. A missing capture
    /// timestamp becomes `0.0`.
    pub fn normalize(packet: &RawPacket, class: Classification) -> Self {
        let timestamp = packet.timestamp.unwrap_or(0.0);
        Self {
            timestamp,
            observed_at: rfc3339(timestamp),
            packet_length: u64::from(packet.wire_length),
            src_ip: class.src_ip.map(|ip| ip.to_string()),
            dst_ip: class.dst_ip.map(|ip| ip.to_string()),
            src_port: class.src_port,
            dst_port: class.dst_port,
            l4_protocol: class.protocol,
        }
    }
}

fn rfc3339(timestamp: f64) -> String {
    DateTime::from_timestamp_millis((timestamp * 1000.0).round() as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Exported label sets ───────────────────────────────────────────────────────

impl EncodeLabelValue for Protocol {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        encoder.write_str(self.as_str())
    }
}

impl EncodeLabelValue for WriteOutcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        encoder.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProtocolLabels {
    protocol: Protocol,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    status: WriteOutcome,
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// Process-wide packet, byte and write-outcome tallies.
///
/// Every update lands twice: in plain atomics for in-process reads, and in
/// the prometheus families served on `/metrics`. Both are monotonic and start
/// at zero. Exported series appear only once a label value is first observed.
pub struct TrafficState {
    packets: [AtomicU64; 4],
    bytes: [AtomicU64; 4],
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
    registry: Registry,
    packets_total: Family<ProtocolLabels, Counter>,
    bytes_total: Family<ProtocolLabels, Counter>,
    write_total: Family<StatusLabels, Counter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolTally {
    pub packets: u64,
    pub bytes: u64,
}

/// Point-in-time copy of the in-process tallies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub protocols: BTreeMap<&'static str, ProtocolTally>,
}

impl TrafficState {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let packets_total = Family::<ProtocolLabels, Counter>::default();
        let bytes_total = Family::<ProtocolLabels, Counter>::default();
        let write_total = Family::<StatusLabels, Counter>::default();

        registry.register(
            "pcap_packets",
            "Packets read from the capture file, by transport protocol",
            packets_total.clone(),
        );
        registry.register(
            "pcap_bytes",
            "Wire bytes read from the capture file, by transport protocol",
            bytes_total.clone(),
        );
        registry.register(
            "pcap_elastic_write",
            "Document store writes by terminal outcome",
            write_total.clone(),
        );

        Self {
            packets: Default::default(),
            bytes: Default::default(),
            writes_ok: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
            registry,
            packets_total,
            bytes_total,
            write_total,
        }
    }

    pub fn record_packet(&self, protocol: Protocol, length: u64) {
        self.packets[protocol.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes[protocol.index()].fetch_add(length, Ordering::Relaxed);

        let labels = ProtocolLabels { protocol };
        self.packets_total.get_or_create(&labels).inc();
        self.bytes_total.get_or_create(&labels).inc_by(length);
    }

    pub fn record_write_outcome(&self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Success => self.writes_ok.fetch_add(1, Ordering::Relaxed),
            WriteOutcome::Fail => self.writes_failed.fetch_add(1, Ordering::Relaxed),
        };
        self.write_total
            .get_or_create(&StatusLabels { status: outcome })
            .inc();
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let mut snapshot = TrafficSnapshot {
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for protocol in Protocol::ALL {
            let tally = ProtocolTally {
                packets: self.packets[protocol.index()].load(Ordering::Relaxed),
                bytes: self.bytes[protocol.index()].load(Ordering::Relaxed),
            };
            snapshot.total_packets += tally.packets;
            snapshot.total_bytes += tally.bytes;
            snapshot.protocols.insert(protocol.as_str(), tally);
        }
        snapshot
    }

    /// Render the exported counters in the text exposition format.
    pub fn encode_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for TrafficState {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets a side effect through a fixed number of times, then suppresses it.
#[derive(Debug)]
pub struct LogBudget {
    remaining: AtomicUsize,
}

impl LogBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
        }
    }

    /// Spend one unit. Returns `false` once the budget is exhausted.
    pub fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}
