//! Protocol decoders that can be plugged into the capture pipeline.

use crate::error::ConfigError;
use crate::flow::StreamKey;
use crate::redis::Redis;
use std::fmt;
use std::io::BufRead;

/// Arguments of one command read off the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedCommand {
    pub args: Vec<String>,
}

impl fmt::Display for DecodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/// Where decoded commands end up.
pub trait CommandSink: Send + Sync {
    fn emit(&self, key: &StreamKey, command: &DecodedCommand);
}

/// Prints one line per command.
pub struct StdoutSink;

impl CommandSink for StdoutSink {
    fn emit(&self, _key: &StreamKey, command: &DecodedCommand) {
        println!("{}", command);
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str;

    /// Configure the plugin from `flag value` pairs given on the command line.
    fn set_flags(&mut self, params: &[String]) -> Result<(), ConfigError>;

    /// Capture filter restricting traffic to what this plugin understands.
    fn bpf_filter(&self) -> String;

    /// Decode one direction of a connection until the stream ends.
    /// Blocks on `reader` while waiting for more bytes.
    fn resolve_stream(&self, key: &StreamKey, reader: &mut dyn BufRead, sink: &dyn CommandSink);
}

/// Find a plugin by name, case insensitive.
pub fn lookup(name: &str) -> Result<Box<dyn Plugin>, ConfigError> {
    match name.to_ascii_lowercase().as_str() {
        "redis" => Ok(Box::new(Redis::default())),
        _ => Err(ConfigError::UnknownPlugin(name.to_string())),
    }
}
