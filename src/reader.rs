//! One-writer/one-reader byte pipe between the reassembler and a decoder.
//!
//! The [`StreamWriter`] side is handed to the [`Assembler`](crate::reassembler::Assembler)
//! as the stream consumer, the [`StreamReader`] side is moved into the decoder thread.
//! Reads block while the pipe is empty and open. Closing (or dropping) the writer
//! ends the stream: the reader drains what is left and then sees end-of-file.

use crate::reassembler::Stream;
use log::debug;
use std::io::{self, BufRead, Read};
use std::sync::mpsc::{channel, Receiver, Sender};

pub fn stream_pipe() -> (StreamWriter, StreamReader) {
    let (tx, rx) = channel();
    (
        StreamWriter { tx: Some(tx) },
        StreamReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

pub struct StreamWriter {
    tx: Option<Sender<Vec<u8>>>,
}

impl Stream for StreamWriter {
    fn reassembled(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(data.to_vec()).is_err() {
                // reader is gone, nobody will look at the rest
                debug!("stream reader dropped, discarding {} bytes", data.len());
                self.tx = None;
            }
        }
    }

    fn reassembly_complete(&mut self) {
        self.tx = None;
    }
}

pub struct StreamReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for StreamReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                // writer closed: end of stream
                Err(_) => {
                    self.chunk.clear();
                    self.pos = 0;
                    break;
                }
            }
        }
        Ok(&self.chunk[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.chunk.len());
    }
}
