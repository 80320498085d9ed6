//! Capture file reader.
//!
//! Reads legacy pcap and pcapng containers (optionally gzip-compressed) and
//! hands out one [`RawPacket`] at a time, in file order.

use std::fs::File;
use std::io::Read;
use std::iter::FusedIterator;
use std::path::Path;

use flate2::read::GzDecoder;
use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};
use tokio::sync::mpsc::Sender;

use crate::error::CaptureError;

/// Initial buffer size handed to the pcap-parser readers (64KB).
const BUFFER_SIZE: usize = 65536;

/// Upper bound when growing the buffer for an oversized record (64MB).
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Link type assumed when a packet references an interface we never saw.
const DEFAULT_LINK_TYPE: i32 = 1;

/// A packet as read from the capture file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    /// Frame number (1-indexed).
    pub frame_number: u64,
    /// Capture time in seconds since the epoch, when the container records one.
    pub timestamp: Option<f64>,
    /// Length of the packet on the wire.
    pub wire_length: u32,
    /// Number of bytes actually captured.
    pub captured_length: u32,
    /// Link layer type (1 = Ethernet, 101 = raw IP, ...).
    pub link_type: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Interface {
    link_type: i32,
    /// Timestamp ticks per second.
    resolution: f64,
    /// Seconds added to every timestamp on this interface.
    offset: f64,
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            link_type: DEFAULT_LINK_TYPE,
            resolution: 1_000_000.0,
            offset: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LegacyHeader {
    link_type: i32,
    nanosecond: bool,
}

enum ReaderInner {
    Legacy(LegacyPcapReader<Box<dyn Read + Send>>),
    Ng(PcapNGReader<Box<dyn Read + Send>>),
}

/// Lazy, forward-only reader over a pcap or pcapng file.
///
/// The reader is finished after the end of the file or the first error:
/// every later call yields `None`.
pub struct CaptureReader {
    inner: ReaderInner,
    frame_number: u64,
    buffer_size: usize,
    done: bool,
    legacy: LegacyHeader,
    interfaces: Vec<Interface>,
}

impl CaptureReader {
    /// Open a capture file, detecting gzip compression and container format.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CaptureError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let gzipped = is_gzip_file(path)?;

        let mut magic = [0u8; 4];
        open_stream(path, gzipped)?
            .read_exact(&mut magic)
            .map_err(|_| invalid("file too short to read magic number".to_string()))?;

        // The magic bytes were consumed, so start over on a fresh stream.
        let stream = open_stream(path, gzipped)?;
        let inner = match magic {
            [0xd4, 0xc3, 0xb2, 0xa1]
            | [0xa1, 0xb2, 0xc3, 0xd4]
            | [0x4d, 0x3c, 0xb2, 0xa1]
            | [0xa1, 0xb2, 0x3c, 0x4d] => ReaderInner::Legacy(
                LegacyPcapReader::new(BUFFER_SIZE, stream)
                    .map_err(|e| invalid(format!("failed to parse pcap header: {e}")))?,
            ),
            [0x0a, 0x0d, 0x0d, 0x0a] => ReaderInner::Ng(
                PcapNGReader::new(BUFFER_SIZE, stream)
                    .map_err(|e| invalid(format!("failed to parse pcapng header: {e}")))?,
            ),
            _ => return Err(invalid(format!("unknown magic number: {magic:02x?}"))),
        };

        Ok(Self {
            inner,
            frame_number: 0,
            buffer_size: BUFFER_SIZE,
            done: false,
            legacy: LegacyHeader {
                link_type: DEFAULT_LINK_TYPE,
                nanosecond: false,
            },
            interfaces: Vec::new(),
        })
    }

    /// Number of packets handed out so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    /// Read the next packet, or `None` once the file is exhausted.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        if self.done {
            return Ok(None);
        }
        let result = match &mut self.inner {
            ReaderInner::Legacy(reader) => next_legacy(
                reader,
                &mut self.legacy,
                &mut self.frame_number,
                &mut self.buffer_size,
            ),
            ReaderInner::Ng(reader) => next_ng(
                reader,
                &mut self.interfaces,
                &mut self.frame_number,
                &mut self.buffer_size,
            ),
        };
        if !matches!(result, Ok(Some(_))) {
            self.done = true;
        }
        result
    }
}

impl Iterator for CaptureReader {
    type Item = Result<RawPacket, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}

impl FusedIterator for CaptureReader {}

/// Drain `reader` into `tx` until the file ends, the reader fails, or the
/// receiving side goes away. Blocking; run it on its own thread.
pub fn forward(mut reader: CaptureReader, tx: Sender<RawPacket>) {
    for item in reader.by_ref() {
        match item {
            Ok(packet) => {
                if tx.blocking_send(packet).is_err() {
                    tracing::debug!("packet receiver dropped, stopping capture reader");
                    return;
                }
            }
            Err(e) => {
                tracing::error!("capture read failed: {}", e);
                break;
            }
        }
    }
    tracing::debug!("capture reader finished after {} frames", reader.frame_count());
}

fn next_legacy<R: PcapReaderIterator>(
    reader: &mut R,
    header: &mut LegacyHeader,
    frame_number: &mut u64,
    buffer_size: &mut usize,
) -> Result<Option<RawPacket>, CaptureError> {
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let packet = match block {
                    PcapBlockOwned::LegacyHeader(hdr) => {
                        header.link_type = hdr.network.0;
                        header.nanosecond = hdr.is_nanosecond_precision();
                        None
                    }
                    PcapBlockOwned::Legacy(block) => {
                        *frame_number += 1;
                        let divisor = if header.nanosecond {
                            1_000_000_000.0
                        } else {
                            1_000_000.0
                        };
                        Some(RawPacket {
                            frame_number: *frame_number,
                            timestamp: Some(block.ts_sec as f64 + block.ts_usec as f64 / divisor),
                            wire_length: block.origlen,
                            captured_length: block.caplen,
                            link_type: header.link_type,
                            data: block.data.to_vec(),
                        })
                    }
                    _ => None,
                };
                reader.consume(offset);
                if packet.is_some() {
                    return Ok(packet);
                }
            }
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("refill error: {e}")))?;
            }
            Err(PcapError::BufferTooSmall) => grow_buffer(reader, buffer_size)?,
            Err(PcapError::UnexpectedEof) => return Err(truncated(*frame_number)),
            Err(e) => return Err(invalid(format!("parse error: {e}"))),
        }
    }
}

fn next_ng<R: PcapReaderIterator>(
    reader: &mut R,
    interfaces: &mut Vec<Interface>,
    frame_number: &mut u64,
    buffer_size: &mut usize,
) -> Result<Option<RawPacket>, CaptureError> {
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let packet = match block {
                    // Interface ids are scoped to their section.
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        interfaces.clear();
                        None
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        interfaces.push(Interface {
                            link_type: idb.linktype.0,
                            resolution: ts_resolution(idb.if_tsresol),
                            offset: idb.if_tsoffset as f64,
                        });
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        *frame_number += 1;
                        let iface = interfaces
                            .get(epb.if_id as usize)
                            .copied()
                            .unwrap_or_default();
                        let ticks = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                        Some(RawPacket {
                            frame_number: *frame_number,
                            timestamp: Some(ticks as f64 / iface.resolution + iface.offset),
                            wire_length: epb.origlen,
                            captured_length: epb.caplen,
                            link_type: iface.link_type,
                            data: epb.data.to_vec(),
                        })
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        *frame_number += 1;
                        let iface = interfaces.first().copied().unwrap_or_default();
                        Some(RawPacket {
                            frame_number: *frame_number,
                            timestamp: None,
                            wire_length: spb.origlen,
                            captured_length: spb.data.len() as u32,
                            link_type: iface.link_type,
                            data: spb.data.to_vec(),
                        })
                    }
                    _ => None,
                };
                reader.consume(offset);
                if packet.is_some() {
                    return Ok(packet);
                }
            }
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("refill error: {e}")))?;
            }
            Err(PcapError::BufferTooSmall) => grow_buffer(reader, buffer_size)?,
            Err(PcapError::UnexpectedEof) => return Err(truncated(*frame_number)),
            Err(e) => return Err(invalid(format!("parse error: {e}"))),
        }
    }
}

/// Ticks per second for a pcapng `if_tsresol` value: a power of ten, or a
/// power of two when the high bit is set.
fn ts_resolution(tsresol: u8) -> f64 {
    let exponent = i32::from(tsresol & 0x7f);
    if tsresol & 0x80 == 0 {
        10f64.powi(exponent)
    } else {
        2f64.powi(exponent)
    }
}

fn open_stream(path: &Path, gzipped: bool) -> Result<Box<dyn Read + Send>, CaptureError> {
    let file = File::open(path).map_err(|_| CaptureError::FileNotFound {
        path: path.display().to_string(),
    })?;
    Ok(if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    })
}

/// Check if a file is gzipped by extension or magic bytes.
fn is_gzip_file(path: &Path) -> Result<bool, CaptureError> {
    let by_extension = path
        .file_name()
        .and_then(|f| f.to_str())
        .is_some_and(|name| name.to_lowercase().ends_with(".gz"));
    if by_extension {
        return Ok(true);
    }

    let mut magic = [0u8; 2];
    match File::open(path)?.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(_) => Ok(false),
    }
}

/// Double the read buffer so the next record fits, then refill it.
fn grow_buffer<R: PcapReaderIterator>(
    reader: &mut R,
    buffer_size: &mut usize,
) -> Result<(), CaptureError> {
    let new_size = buffer_size.saturating_mul(2);
    if new_size > MAX_BUFFER_SIZE || !reader.grow(new_size) {
        return Err(invalid(format!(
            "record does not fit in a {} byte buffer",
            buffer_size
        )));
    }
    tracing::debug!("capture buffer grown to {} bytes", new_size);
    *buffer_size = new_size;
    reader
        .refill()
        .map_err(|e| invalid(format!("refill error: {e}")))
}

fn truncated(frame_number: u64) -> CaptureError {
    invalid(format!(
        "capture truncated after frame {frame_number}: last record is incomplete"
    ))
}

fn invalid(reason: String) -> CaptureError {
    CaptureError::InvalidFormat { reason }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FRAME: [u8; 14] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // dst MAC
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, // src MAC
        0x08, 0x06, // EtherType (ARP)
    ];

    /// Legacy little-endian pcap with one Ethernet frame per entry.
    pub(crate) fn legacy_pcap(packets: &[(u32, u32, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0xd4, 0xc3, 0xb2, 0xa1]); // magic
        data.extend_from_slice(&2u16.to_le_bytes()); // version major
        data.extend_from_slice(&4u16.to_le_bytes()); // version minor
        data.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        data.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        data.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        data.extend_from_slice(&1u32.to_le_bytes()); // network (Ethernet)

        for (ts_sec, ts_usec, frame) in packets {
            data.extend_from_slice(&ts_sec.to_le_bytes());
            data.extend_from_slice(&ts_usec.to_le_bytes());
            data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            data.extend_from_slice(frame);
        }
        data
    }

    /// pcapng with one section, one raw-IPv4 interface and one enhanced packet.
    fn pcapng(ticks: u64, frame: &[u8], origlen: u32) -> Vec<u8> {
        let mut data = Vec::new();

        // Section header block.
        data.extend_from_slice(&0x0a0d_0d0au32.to_le_bytes());
        data.extend_from_slice(&28u32.to_le_bytes());
        data.extend_from_slice(&0x1a2b_3c4du32.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&(-1i64).to_le_bytes());
        data.extend_from_slice(&28u32.to_le_bytes());

        // Interface description block with if_tsresol = 6.
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&32u32.to_le_bytes());
        data.extend_from_slice(&228u16.to_le_bytes()); // LINKTYPE_IPV4
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&65535u32.to_le_bytes());
        data.extend_from_slice(&9u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&[6, 0, 0, 0]);
        data.extend_from_slice(&[0, 0, 0, 0]); // opt_endofopt
        data.extend_from_slice(&32u32.to_le_bytes());

        // Enhanced packet block.
        let padded = (frame.len() + 3) & !3;
        let total = 32 + padded as u32;
        data.extend_from_slice(&6u32.to_le_bytes());
        data.extend_from_slice(&total.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&((ticks >> 32) as u32).to_le_bytes());
        data.extend_from_slice(&(ticks as u32).to_le_bytes());
        data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        data.extend_from_slice(&origlen.to_le_bytes());
        data.extend_from_slice(frame);
        data.resize(data.len() + padded - frame.len(), 0);
        data.extend_from_slice(&total.to_le_bytes());

        data
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(bytes).unwrap();
        temp.flush().unwrap();
        temp
    }

    #[test]
    fn test_reads_legacy_pcap_in_order() {
        let temp = write_temp(&legacy_pcap(&[
            (1_000_000_000, 250_000, &FRAME[..]),
            (1_000_000_001, 0, &FRAME[..]),
        ]));

        let packets: Vec<RawPacket> = CaptureReader::open(temp.path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].frame_number, 1);
        assert_eq!(packets[0].timestamp, Some(1_000_000_000.25));
        assert_eq!(packets[0].wire_length, 14);
        assert_eq!(packets[0].link_type, 1);
        assert_eq!(packets[0].data, FRAME.to_vec());
        assert_eq!(packets[1].frame_number, 2);
        assert_eq!(packets[1].timestamp, Some(1_000_000_001.0));
    }

    #[test]
    fn test_reads_pcapng_enhanced_packet() {
        let ip = [0x45u8; 20];
        let temp = write_temp(&pcapng(1_700_000_000_500_000, &ip, 60));

        let mut reader = CaptureReader::open(temp.path()).unwrap();
        let packet = reader.next_packet().unwrap().unwrap();

        assert_eq!(packet.timestamp, Some(1_700_000_000.5));
        assert_eq!(packet.link_type, 228);
        assert_eq!(packet.wire_length, 60);
        assert_eq!(packet.captured_length, 20);
        assert!(reader.next_packet().unwrap().is_none());
        assert_eq!(reader.frame_count(), 1);
    }

    #[test]
    fn test_reads_gzipped_pcap() {
        let temp = NamedTempFile::with_suffix(".pcap.gz").unwrap();
        {
            let file = File::create(temp.path()).unwrap();
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder
                .write_all(&legacy_pcap(&[(10, 0, &FRAME[..])]))
                .unwrap();
            encoder.finish().unwrap();
        }

        let packets: Vec<_> = CaptureReader::open(temp.path()).unwrap().collect();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = CaptureReader::open("/nonexistent/capture.pcapng").err().unwrap();
        assert!(matches!(err, CaptureError::FileNotFound { .. }));
    }

    #[test]
    fn test_unknown_magic_is_rejected() {
        let temp = write_temp(b"definitely not a capture");
        let err = CaptureReader::open(temp.path()).err().unwrap();
        assert!(matches!(err, CaptureError::InvalidFormat { .. }));
    }

    #[test]
    fn test_record_larger_than_initial_buffer() {
        let small = [0x11u8; 60];
        let large = vec![0x22u8; 70_000];
        let temp = write_temp(&legacy_pcap(&[
            (1, 0, &small[..]),
            (2, 0, &large[..]),
            (3, 0, &small[..]),
        ]));

        let packets: Vec<RawPacket> = CaptureReader::open(temp.path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let lengths: Vec<(u64, u32)> = packets.iter().map(|p| (p.frame_number, p.wire_length)).collect();
        assert_eq!(lengths, vec![(1, 60), (2, 70_000), (3, 60)]);
        assert_eq!(packets[1].data, large);
    }

    #[test]
    fn test_pcapng_block_larger_than_initial_buffer() {
        let large = vec![0x45u8; 70_000];
        let temp = write_temp(&pcapng(1_000_000, &large, 70_000));

        let mut reader = CaptureReader::open(temp.path()).unwrap();
        let packet = reader.next_packet().unwrap().unwrap();
        assert_eq!(packet.captured_length, 70_000);
        assert_eq!(packet.data.len(), 70_000);
        assert!(reader.next_packet().unwrap().is_none());
    }

    /// Two complete records followed by one cut short, as left by a killed capture.
    fn truncated_pcap() -> Vec<u8> {
        let mut bytes = legacy_pcap(&[(1, 0, &FRAME[..]), (2, 0, &FRAME[..]), (3, 0, &FRAME[..])]);
        bytes.truncate(bytes.len() - 10);
        bytes
    }

    #[test]
    fn test_truncated_tail_ends_the_reader() {
        let temp = write_temp(&truncated_pcap());
        let mut reader = CaptureReader::open(temp.path()).unwrap();

        let items: Vec<_> = reader.by_ref().collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().frame_number, 1);
        assert_eq!(items[1].as_ref().unwrap().frame_number, 2);
        assert!(matches!(items[2], Err(CaptureError::InvalidFormat { .. })));

        assert!(reader.next().is_none());
        assert!(reader.next_packet().unwrap().is_none());
        assert_eq!(reader.frame_count(), 2);
    }

    #[test]
    fn test_forward_stops_at_read_error() {
        let temp = write_temp(&truncated_pcap());
        let reader = CaptureReader::open(temp.path()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);

        let handle = std::thread::spawn(move || forward(reader, tx));
        let mut frames = Vec::new();
        while let Some(packet) = rx.blocking_recv() {
            frames.push(packet.frame_number);
        }
        handle.join().unwrap();

        assert_eq!(frames, vec![1, 2]);
    }

    #[test]
    fn test_ts_resolution() {
        assert_eq!(ts_resolution(6), 1_000_000.0);
        assert_eq!(ts_resolution(9), 1_000_000_000.0);
        assert_eq!(ts_resolution(0x80 | 10), 1024.0);
    }

    #[test]
    fn test_forward_preserves_order() {
        let temp = write_temp(&legacy_pcap(&[(1, 0, &FRAME[..]), (2, 0, &FRAME[..]), (3, 0, &FRAME[..])]));
        let reader = CaptureReader::open(temp.path()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);

        let handle = std::thread::spawn(move || forward(reader, tx));
        let mut frames = Vec::new();
        while let Some(packet) = rx.blocking_recv() {
            frames.push(packet.frame_number);
        }
        handle.join().unwrap();

        assert_eq!(frames, vec![1, 2, 3]);
    }
}
