use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{AppSettings, Parser};
use log::info;
use stream_sniffer::config::{self, Config};
use stream_sniffer::plugin::{self, StdoutSink};

/// Sniff a TCP service and print the commands its clients send.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(setting = AppSettings::TrailingVarArg)]
struct Cli {
    /// print additional logging information
    #[clap(short, long)]
    verbose: bool,

    /// treat <DEVICE> as a pcap file to replay
    #[clap(long)]
    read_file: bool,

    /// drop packets with a wrong IPv4 or TCP checksum
    #[clap(long)]
    verify_checksums: bool,

    /// seconds between two idle flushes
    #[clap(long, value_name = "SECS", default_value_t = 60)]
    flush_interval: u64,

    /// seconds without traffic after which a stream is flushed
    #[clap(long, value_name = "SECS", default_value_t = 120)]
    idle_timeout: u64,

    #[clap(long, value_name = "BYTES", default_value_t = config::DEFAULT_SNAPLEN)]
    snaplen: i32,

    /// pcap read timeout
    #[clap(long, value_name = "MS", default_value_t = config::DEFAULT_TIMEOUT_MS)]
    timeout_ms: i32,

    /// interface to listen on
    device: String,

    /// protocol plugin (redis)
    plugin: String,

    /// plugin parameters, e.g. -p 6379 -m strict
    #[clap(allow_hyphen_values = true, multiple_values = true)]
    plugin_params: Vec<String>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            println!("{}", e);
            println!("stream_sniffer [device] [plugin] [plugin's params(optional)]");
            process::exit(1);
        }
        Err(e) => e.exit(),
    };
    if cli.verbose && env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let mut plugin = match plugin::lookup(&cli.plugin) {
        Ok(plugin) => plugin,
        Err(e) => {
            println!("{}", e);
            process::exit(1);
        }
    };
    if let Err(e) = plugin.set_flags(&cli.plugin_params) {
        println!("{}", e);
        process::exit(1);
    }

    let config = Config {
        device: cli.device,
        read_file: cli.read_file,
        snaplen: cli.snaplen,
        timeout_ms: cli.timeout_ms,
        verify_checksums: cli.verify_checksums,
        flush_interval: Duration::from_secs(cli.flush_interval),
        idle_timeout: Duration::from_secs(cli.idle_timeout),
    };
    match stream_sniffer::run(&config, Arc::from(plugin), Arc::new(StdoutSink)) {
        Ok(stats) => info!("{:?}", stats),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_params_keep_their_flags() {
        let cli = Cli::try_parse_from([
            "stream_sniffer",
            "eth0",
            "redis",
            "-p",
            "7000",
            "-m",
            "strict",
        ])
        .unwrap();
        assert_eq!(cli.device, "eth0");
        assert_eq!(cli.plugin, "redis");
        assert_eq!(cli.plugin_params, vec!["-p", "7000", "-m", "strict"]);
        assert!(!cli.read_file);
    }

    #[test]
    fn options_before_positionals() {
        let cli =
            Cli::try_parse_from(["stream_sniffer", "-v", "--read-file", "dump.pcap", "redis"])
                .unwrap();
        assert!(cli.verbose);
        assert!(cli.read_file);
        assert_eq!(cli.device, "dump.pcap");
        assert!(cli.plugin_params.is_empty());
        assert_eq!(cli.idle_timeout, 120);
    }

    #[test]
    fn missing_plugin_is_a_usage_error() {
        assert!(Cli::try_parse_from(["stream_sniffer", "eth0"]).is_err());
        assert!(Cli::try_parse_from(["stream_sniffer"]).is_err());
    }
}
