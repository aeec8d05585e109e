//! Redis multibulk command decoder.
//!
//! A command on the wire looks like
//!
//! ```text
//! *2\r\n$3\r\nGET\r\n$3\r\nkey\r\n
//! ```
//!
//! Lines that do not start a frame are skipped. In lenient mode the `$len`
//! headers are consumed without being checked, in strict mode they are
//! validated and exactly `len` payload bytes are read.

use crate::error::ConfigError;
use crate::flow::StreamKey;
use crate::plugin::{CommandSink, DecodedCommand, Plugin};
use log::debug;
use std::io::{BufRead, Read};
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 6379;
const VERSION: &str = "0.1";
/// largest bulk string redis itself accepts
const MAX_BULK_LEN: u64 = 512 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Lenient,
    Strict,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lenient" => Ok(Mode::Lenient),
            "strict" => Ok(Mode::Strict),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Redis {
    port: u16,
    mode: Mode,
}

impl Default for Redis {
    fn default() -> Self {
        Redis {
            port: DEFAULT_PORT,
            mode: Mode::Lenient,
        }
    }
}

impl Redis {
    pub fn new(port: u16, mode: Mode) -> Redis {
        Redis { port, mode }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }
}

impl Plugin for Redis {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn version(&self) -> &'static str {
        VERSION
    }

    fn set_flags(&mut self, params: &[String]) -> Result<(), ConfigError> {
        if params.len() % 2 != 0 {
            return Err(ConfigError::OddParams(params.len()));
        }
        for pair in params.chunks(2) {
            let (key, val) = (&pair[0], &pair[1]);
            match key.as_str() {
                "-p" => {
                    self.port = val
                        .parse()
                        .map_err(|_| ConfigError::InvalidPort(val.clone()))?;
                }
                "-m" => self.mode = val.parse()?,
                other => return Err(ConfigError::UnknownFlag(other.to_string())),
            }
        }
        Ok(())
    }

    fn bpf_filter(&self) -> String {
        format!("tcp and port {}", self.port)
    }

    fn resolve_stream(&self, key: &StreamKey, reader: &mut dyn BufRead, sink: &dyn CommandSink) {
        // replies come from the server port, only client commands are of interest
        let from_server = key.src().port() == self.port;
        let mut emitted = 0usize;
        for command in CommandReader::new(reader, self.mode) {
            if from_server {
                continue;
            }
            sink.emit(key, &command);
            emitted += 1;
        }
        debug!("{} stream ended after {} commands", key, emitted);
    }
}

enum Frame {
    Complete(DecodedCommand),
    /// stream ended inside the frame
    Truncated,
    /// strict mode only, resync on the next header
    Malformed,
}

/// Lazily decodes commands from an ordered byte stream.
/// Ends when the stream ends; a frame cut short by the end is dropped.
pub struct CommandReader<R: BufRead> {
    reader: R,
    mode: Mode,
    done: bool,
}

impl<R: BufRead> CommandReader<R> {
    pub fn new(reader: R, mode: Mode) -> CommandReader<R> {
        CommandReader {
            reader,
            mode,
            done: false,
        }
    }

    /// Next `\n` terminated line without its terminator.
    /// `None` at end of stream, including a trailing unterminated line.
    fn read_line(&mut self) -> Option<Vec<u8>> {
        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(_) if line.last() == Some(&b'\n') => {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some(line)
            }
            Ok(_) => None,
            Err(e) => {
                debug!("stream read failed: {}", e);
                None
            }
        }
    }

    fn read_elements(&mut self, count: usize) -> Frame {
        let mut args = Vec::with_capacity(count.min(64));
        // each element is a length header line followed by the payload line
        for i in 0..count.saturating_mul(2) {
            let line = match self.read_line() {
                Some(line) => line,
                None => return Frame::Truncated,
            };
            if i % 2 == 1 {
                args.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        Frame::Complete(DecodedCommand { args })
    }

    fn read_elements_strict(&mut self, count: usize) -> Frame {
        let mut args = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let header = match self.read_line() {
                Some(line) => line,
                None => return Frame::Truncated,
            };
            let len = match parse_prefixed(&header, b'$') {
                Some(len) if (0..=MAX_BULK_LEN as i64).contains(&len) => len as u64,
                _ => {
                    debug!(
                        "bad bulk length header {:?}, dropping frame",
                        String::from_utf8_lossy(&header)
                    );
                    return Frame::Malformed;
                }
            };
            let mut payload = Vec::new();
            match (&mut self.reader).take(len + 2).read_to_end(&mut payload) {
                Ok(n) if n as u64 == len + 2 => {}
                Ok(_) => return Frame::Truncated,
                Err(e) => {
                    debug!("stream read failed: {}", e);
                    return Frame::Truncated;
                }
            }
            if !payload.ends_with(b"\r\n") {
                debug!("bulk string of length {} not followed by CRLF, dropping frame", len);
                return Frame::Malformed;
            }
            payload.truncate(len as usize);
            args.push(String::from_utf8_lossy(&payload).into_owned());
        }
        Frame::Complete(DecodedCommand { args })
    }
}

impl<R: BufRead> Iterator for CommandReader<R> {
    type Item = DecodedCommand;

    fn next(&mut self) -> Option<DecodedCommand> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.read_line() {
                Some(line) => line,
                None => break,
            };
            // anything but a multibulk header is noise
            let count = match parse_prefixed(&line, b'*') {
                Some(count) => count,
                None => continue,
            };
            if count <= 0 {
                return Some(DecodedCommand::default());
            }
            let frame = match self.mode {
                Mode::Lenient => self.read_elements(count as usize),
                Mode::Strict => self.read_elements_strict(count as usize),
            };
            match frame {
                Frame::Complete(command) => return Some(command),
                Frame::Truncated => break,
                Frame::Malformed => continue,
            }
        }
        self.done = true;
        None
    }
}

/// Parse `<marker><decimal>`.
fn parse_prefixed(line: &[u8], marker: u8) -> Option<i64> {
    match line.split_first() {
        Some((first, rest)) if *first == marker => std::str::from_utf8(rest).ok()?.parse().ok(),
        _ => None,
    }
}
