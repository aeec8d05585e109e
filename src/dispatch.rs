//! Capture loop tying packet source, reassembler and decoders together.

use crate::capture::{CapturedPacket, Next, PacketSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::{decode_packet, StreamKey};
use crate::plugin::{CommandSink, Plugin};
use crate::reader::stream_pipe;
use crate::reassembler::{Assembler, Stream, StreamFactory};
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Registry of running decoder threads.
#[derive(Default)]
pub struct DecoderPool {
    handles: Vec<(StreamKey, JoinHandle<()>)>,
}

impl DecoderPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn push(&mut self, key: StreamKey, handle: JoinHandle<()>) {
        self.handles.push((key, handle));
    }

    /// Join decoders whose stream has ended.
    pub fn reap(&mut self) -> usize {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .handles
            .drain(..)
            .partition(|(_, handle)| handle.is_finished());
        self.handles = running;
        let count = finished.len();
        for (key, handle) in finished {
            join(key, handle);
        }
        count
    }

    /// Wait for every decoder. Their streams must already be closed.
    pub fn join_all(&mut self) {
        for (key, handle) in self.handles.drain(..) {
            join(key, handle);
        }
    }
}

fn join(key: StreamKey, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("decoder for {} panicked", key);
    }
}

/// Spawns a decoder thread for every new stream.
pub struct DecoderFactory {
    plugin: Arc<dyn Plugin>,
    sink: Arc<dyn CommandSink>,
    pool: DecoderPool,
    spawn_error: Option<io::Error>,
}

impl DecoderFactory {
    pub fn new(plugin: Arc<dyn Plugin>, sink: Arc<dyn CommandSink>) -> DecoderFactory {
        DecoderFactory {
            plugin,
            sink,
            pool: DecoderPool::default(),
            spawn_error: None,
        }
    }

    pub fn pool(&self) -> &DecoderPool {
        &self.pool
    }
}

impl StreamFactory for DecoderFactory {
    fn new_stream(&mut self, key: &StreamKey) -> Box<dyn Stream> {
        let (writer, mut reader) = stream_pipe();
        let plugin = Arc::clone(&self.plugin);
        let sink = Arc::clone(&self.sink);
        let stream_key = *key;
        let spawned = thread::Builder::new()
            .name(format!("decode {}", key))
            .spawn(move || plugin.resolve_stream(&stream_key, &mut reader, sink.as_ref()));
        match spawned {
            Ok(handle) => self.pool.push(*key, handle),
            Err(e) => {
                warn!("could not start decoder for {}: {}", key, e);
                self.spawn_error = Some(e);
            }
        }
        Box::new(writer)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub packets: u64,
    /// non tcp or undecodable packets
    pub skipped: u64,
    pub streams_flushed: u64,
}

pub struct Dispatcher<S: PacketSource> {
    source: S,
    assembler: Assembler<DecoderFactory>,
    verify_checksums: bool,
    flush_interval: Duration,
    idle_timeout: Duration,
    next_flush: Option<SystemTime>,
    stats: DispatchStats,
}

impl<S: PacketSource> Dispatcher<S> {
    pub fn new(
        source: S,
        plugin: Arc<dyn Plugin>,
        sink: Arc<dyn CommandSink>,
        config: &Config,
    ) -> Dispatcher<S> {
        Dispatcher {
            source,
            assembler: Assembler::new(DecoderFactory::new(plugin, sink)),
            verify_checksums: config.verify_checksums,
            flush_interval: config.flush_interval,
            idle_timeout: config.idle_timeout,
            next_flush: None,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn open_streams(&self) -> usize {
        self.assembler.len()
    }

    pub fn running_decoders(&self) -> usize {
        self.assembler.factory().pool().len()
    }

    /// Consume packets until the source runs dry. A live source never does.
    pub fn run(&mut self) -> Result<DispatchStats> {
        loop {
            match self.source.next_packet()? {
                Next::Packet(packet) => self.handle_packet(packet)?,
                Next::Idle => {}
                Next::Exhausted => break,
            }
            let now = self.source.now();
            self.tick(now);
        }
        self.shutdown();
        Ok(self.stats)
    }

    pub fn handle_packet(&mut self, packet: CapturedPacket) -> Result<()> {
        self.stats.packets += 1;
        match decode_packet(self.source.link_type(), &packet.data, self.verify_checksums) {
            Ok((key, segment)) => {
                self.assembler.submit(key, segment, packet.timestamp);
                if let Some(e) = self.assembler.factory_mut().spawn_error.take() {
                    return Err(Error::Spawn(e));
                }
            }
            Err(e) => {
                self.stats.skipped += 1;
                debug!("skipping packet {}: {}", self.stats.packets, e);
            }
        }
        Ok(())
    }

    /// Periodic idle flush, driven by the capture clock.
    pub fn tick(&mut self, now: SystemTime) {
        let due = *self.next_flush.get_or_insert(now + self.flush_interval);
        if now < due {
            return;
        }
        let cutoff = now.checked_sub(self.idle_timeout).unwrap_or(UNIX_EPOCH);
        let flushed = self.assembler.flush_older_than(cutoff);
        self.stats.streams_flushed += flushed as u64;
        let reaped = self.assembler.factory_mut().pool.reap();
        if flushed > 0 {
            info!(
                "flushed {} idle streams, {} open, {} decoders finished",
                flushed,
                self.assembler.len(),
                reaped
            );
        }
        self.next_flush = Some(now + self.flush_interval);
    }

    /// Close every stream and wait for the decoders to drain.
    pub fn shutdown(&mut self) {
        let flushed = self.assembler.flush_all();
        self.stats.streams_flushed += flushed as u64;
        self.assembler.factory_mut().pool.join_all();
        info!(
            "capture finished: {} packets, {} skipped",
            self.stats.packets, self.stats.skipped
        );
    }
}
