use crate::flow::{SegmentRecord, StreamKey};
use log::{debug, info};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::SystemTime;

/// Consumer of one reassembled one-way stream.
pub trait Stream {
    /// Called with the next contiguous bytes of the stream, in order.
    fn reassembled(&mut self, data: &[u8]);
    /// Called exactly once, after the last call to `reassembled`.
    fn reassembly_complete(&mut self);
}

/// Creates the consumer for every newly observed one-way stream.
pub trait StreamFactory {
    fn new_stream(&mut self, key: &StreamKey) -> Box<dyn Stream>;
}

/// Position in the stream, counted in bytes from the first sequence number seen.
/// Kept as u64 so that buffered segments stay ordered across sequence number wraps.
type Offset = u64;

/// Out of order data waiting for the gap before it to fill.
struct Chunk {
    data: Vec<u8>,
    fin: bool,
}

/// Per direction reassembly state.
/// delayed is able to store multiple data chunks with the same offset
struct TcpStream {
    key: StreamKey,
    next_seq: u32,
    next_offset: Offset,
    delayed: BTreeMap<Offset, Vec<Chunk>>,
    last_seen: SystemTime,
    /// FIN delivered in order, nothing follows
    finished: bool,
    closed: bool,
    consumer: Box<dyn Stream>,
}

impl TcpStream {
    fn new(
        key: StreamKey,
        first: &SegmentRecord,
        consumer: Box<dyn Stream>,
        now: SystemTime,
    ) -> TcpStream {
        // a SYN occupies one sequence number, data starts right after it
        let next_seq = if first.syn {
            first.seq.wrapping_add(1)
        } else {
            first.seq
        };
        TcpStream {
            key,
            next_seq,
            next_offset: 0,
            delayed: BTreeMap::new(),
            last_seen: now,
            finished: false,
            closed: false,
            consumer,
        }
    }

    /// Stream offset of `seq`. Negative when it lies before the first byte we track.
    fn offset_of(&self, seq: u32) -> i64 {
        let delta = seq.wrapping_sub(self.next_seq) as i32;
        self.next_offset as i64 + delta as i64
    }

    /// A FIN takes effect once every byte before it has been delivered.
    fn add(&mut self, segment: SegmentRecord, now: SystemTime) {
        self.last_seen = now;
        if self.finished || (segment.payload.is_empty() && !segment.fin) {
            return;
        }
        let data_seq = if segment.syn {
            segment.seq.wrapping_add(1)
        } else {
            segment.seq
        };
        let start = self.offset_of(data_seq);
        if start > self.next_offset as i64 {
            debug!(
                "{} out of order segment at offset {}, expecting {}",
                self.key, start, self.next_offset
            );
            self.delayed.entry(start as Offset).or_default().push(Chunk {
                data: segment.payload,
                fin: segment.fin,
            });
        } else {
            self.accept(start, &segment.payload, segment.fin);
            self.check_delayed();
        }
    }

    /// append data starting at or before the next expected offset (overlap handling)
    fn accept(&mut self, start: i64, data: &[u8], fin: bool) {
        self.finished |= fin;
        let overlap = self.next_offset as i64 - start;
        if overlap >= data.len() as i64 {
            // completely covered by already delivered data
            return;
        }
        let fresh = &data[overlap.max(0) as usize..];
        self.next_offset += fresh.len() as Offset;
        self.next_seq = self.next_seq.wrapping_add(fresh.len() as u32);
        self.consumer.reassembled(fresh);
    }

    /// deliver buffered chunks that became contiguous
    fn check_delayed(&mut self) {
        while let Some(mut entry) = self.delayed.first_entry() {
            if self.finished || *entry.key() > self.next_offset {
                return;
            }
            let start = *entry.key() as i64;
            let chunk = entry.get_mut().remove(0);
            if entry.get().is_empty() {
                entry.remove();
            }
            self.accept(start, &chunk.data, chunk.fin);
        }
    }

    /// deliver everything buffered, skipping over gaps
    fn force_drain(&mut self) {
        while let Some((start, chunks)) = self.delayed.pop_first() {
            if self.finished {
                break;
            }
            if start > self.next_offset {
                let gap = start - self.next_offset;
                info!("{} skipping {} missing bytes", self.key, gap);
                self.next_seq = self.next_seq.wrapping_add(gap as u32);
                self.next_offset = start;
            }
            for chunk in chunks {
                self.accept(start as i64, &chunk.data, chunk.fin);
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if !self.delayed.is_empty() {
            debug!(
                "{} closed with {} pending out of order chunks, discarding",
                self.key,
                self.delayed.values().map(Vec::len).sum::<usize>()
            );
            self.delayed.clear();
        }
        self.closed = true;
        self.consumer.reassembly_complete();
    }
}

/// Reassembles TCP segments into per direction ordered byte streams.
pub struct Assembler<F: StreamFactory> {
    factory: F,
    streams: HashMap<StreamKey, TcpStream>,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(factory: F) -> Assembler<F> {
        Assembler {
            factory,
            streams: HashMap::new(),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    /// number of open one-way streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.streams.contains_key(key)
    }

    /// Feed one segment into the stream it belongs to.
    ///
    /// A stream is created on its first SYN or data carrying segment, bare
    /// ACK/FIN/RST segments for unknown streams are ignored. FIN closes the
    /// sending direction once the contiguous data is drained, RST closes both.
    pub fn submit(&mut self, key: StreamKey, segment: SegmentRecord, timestamp: SystemTime) {
        let rst = segment.rst;
        if !self.streams.contains_key(&key) {
            if !segment.syn && segment.payload.is_empty() {
                if rst {
                    self.close_stream(&key.reverse());
                }
                return;
            }
            info!("# Start new stream: {}", key);
            let consumer = self.factory.new_stream(&key);
            self.streams
                .insert(key, TcpStream::new(key, &segment, consumer, timestamp));
        }
        let finished = match self.streams.get_mut(&key) {
            Some(stream) => {
                stream.add(segment, timestamp);
                stream.finished
            }
            None => false,
        };
        if finished || rst {
            self.close_stream(&key);
        }
        if rst {
            self.close_stream(&key.reverse());
        }
    }

    fn close_stream(&mut self, key: &StreamKey) {
        if let Some(mut stream) = self.streams.remove(key) {
            stream.close();
            info!("# Stream closed: {}", key);
        }
    }

    /// Force out every stream that saw no segment since `cutoff`, gaps and all,
    /// and release it. Returns the number of streams flushed.
    pub fn flush_older_than(&mut self, cutoff: SystemTime) -> usize {
        let stale: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.last_seen < cutoff)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            if let Some(mut stream) = self.streams.remove(key) {
                stream.force_drain();
                stream.close();
                info!("# Stream flushed: {}", key);
            }
        }
        stale.len()
    }

    /// Flush and close every stream.
    pub fn flush_all(&mut self) -> usize {
        let count = self.streams.len();
        for (key, mut stream) in self.streams.drain() {
            stream.force_drain();
            stream.close();
            info!("# Stream flushed: {}", key);
        }
        count
    }
}
