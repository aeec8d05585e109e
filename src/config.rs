use std::time::Duration;

pub const DEFAULT_SNAPLEN: i32 = 65535;
pub const DEFAULT_TIMEOUT_MS: i32 = 1000;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Capture and dispatch settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// interface name, or savefile path when `read_file` is set
    pub device: String,
    pub read_file: bool,
    pub snaplen: i32,
    /// pcap read timeout, bounds how late an idle flush can run on a quiet link
    pub timeout_ms: i32,
    pub verify_checksums: bool,
    pub flush_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: String::new(),
            read_file: false,
            snaplen: DEFAULT_SNAPLEN,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            verify_checksums: false,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}
