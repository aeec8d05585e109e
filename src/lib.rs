/*!
This crate sniffs TCP traffic, reassembles each connection into ordered byte streams and
decodes Redis multibulk commands out of them.

The pipeline is made of:

* [`capture::PcapSource`] which opens a live interface (or a savefile) and installs the
  capture filter produced by the plugin.
* [`reassembler::Assembler`] which turns out of order, retransmitted and overlapping TCP
  segments into one ordered byte stream per direction ([`flow::StreamKey`]) and flushes
  streams that went idle.
* [`plugin::Plugin`] implementations (currently [`redis::Redis`]) that decode a stream into
  commands. Every stream is decoded on its own thread, fed through a [`reader::StreamReader`].
* [`dispatch::Dispatcher`] which owns the capture loop.

Usage example:
```no_run
use std::sync::Arc;
use stream_sniffer::{config::Config, plugin, plugin::StdoutSink};

let mut redis = plugin::lookup("redis").unwrap();
redis.set_flags(&["-p".to_string(), "6380".to_string()]).unwrap();
let config = Config {
    device: "eth0".to_string(),
    ..Config::default()
};
stream_sniffer::run(&config, Arc::from(redis), Arc::new(StdoutSink)).unwrap();
```
*/
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod plugin;
pub mod reader;
pub mod reassembler;
pub mod redis;

use capture::{PacketSource, PcapSource};
use config::Config;
use dispatch::{DispatchStats, Dispatcher};
use error::Result;
use log::info;
use plugin::{CommandSink, Plugin};
use std::sync::Arc;

/// Capture according to `config` and decode with `plugin` until the source is exhausted.
/// Live captures only return on error.
pub fn run(
    config: &Config,
    plugin: Arc<dyn Plugin>,
    sink: Arc<dyn CommandSink>,
) -> Result<DispatchStats> {
    info!("plugin {} version {}", plugin.name(), plugin.version());
    let filter = plugin.bpf_filter();
    if config.read_file {
        let source = PcapSource::open_file(&config.device, &filter)?;
        dispatch(source, plugin, sink, config)
    } else {
        let source =
            PcapSource::open_live(&config.device, &filter, config.snaplen, config.timeout_ms)?;
        dispatch(source, plugin, sink, config)
    }
}

fn dispatch<S: PacketSource>(
    source: S,
    plugin: Arc<dyn Plugin>,
    sink: Arc<dyn CommandSink>,
    config: &Config,
) -> Result<DispatchStats> {
    Dispatcher::new(source, plugin, sink, config).run()
}
