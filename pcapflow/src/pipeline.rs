use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::Receiver;
use tokio::time::Duration;

use crate::capture::RawPacket;
use crate::classify::classify;
use crate::state::{LogBudget, PacketRecord, TrafficState};
use crate::storage::{DocumentStore, ResilientWriter, WriteOutcome};

/// Totals for one drain of the capture source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub packets: u64,
    pub bytes: u64,
    pub written: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

/// Classify, normalize, count and store packets strictly one at a time.
pub struct Pipeline<S> {
    writer: ResilientWriter<S>,
    traffic: Arc<TrafficState>,
    verbose: LogBudget,
}

impl<S: DocumentStore> Pipeline<S> {
    pub fn new(writer: ResilientWriter<S>, traffic: Arc<TrafficState>, verbose_packets: usize) -> Self {
        Self {
            writer,
            traffic,
            verbose: LogBudget::new(verbose_packets),
        }
    }

    /// Consume `rx` until the sender side closes. Every packet is counted,
    /// whatever happens to its store write.
    pub async fn run(&self, mut rx: Receiver<RawPacket>) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        while let Some(packet) = rx.recv().await {
            let (record, outcome) = self.process(&packet).await;
            summary.packets += 1;
            summary.bytes += record.packet_length;
            match outcome {
                WriteOutcome::Success => summary.written += 1,
                WriteOutcome::Fail => summary.failed += 1,
            }
        }

        summary.elapsed = started.elapsed();
        summary
    }

    pub async fn process(&self, packet: &RawPacket) -> (PacketRecord, WriteOutcome) {
        let record = PacketRecord::normalize(packet, classify(packet));

        if self.verbose.take() {
            tracing::info!(
                "#{} {} {}:{} -> {}:{} len={} caplen={}",
                packet.frame_number,
                record.l4_protocol,
                record.src_ip.as_deref().unwrap_or("-"),
                record.src_port.map_or_else(|| "-".to_string(), |p| p.to_string()),
                record.dst_ip.as_deref().unwrap_or("-"),
                record.dst_port.map_or_else(|| "-".to_string(), |p| p.to_string()),
                record.packet_length,
                packet.captured_length,
            );
        }

        self.traffic
            .record_packet(record.l4_protocol, record.packet_length);
        let outcome = self.writer.write(&record).await;
        (record, outcome)
    }
}
