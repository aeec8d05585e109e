use crate::error::{Error, Result};
use crate::flow::LinkType;
use log::info;
use pcap::{Activated, Active, Capture, Offline};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct CapturedPacket {
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

pub enum Next {
    Packet(CapturedPacket),
    /// read timeout expired without traffic
    Idle,
    /// savefile fully read
    Exhausted,
}

/// Anything that yields captured frames.
pub trait PacketSource {
    fn link_type(&self) -> LinkType;

    fn next_packet(&mut self) -> Result<Next>;

    /// Current time on the capture clock: wall clock when live,
    /// timestamp of the last packet read when replaying a file.
    fn now(&self) -> SystemTime;
}

pub struct PcapSource<T: Activated + ?Sized> {
    cap: Capture<T>,
    link: LinkType,
    live: bool,
    last_seen: SystemTime,
}

impl PcapSource<Active> {
    /// Open `device` for live capture and install `filter`.
    pub fn open_live(device: &str, filter: &str, snaplen: i32, timeout_ms: i32) -> Result<Self> {
        let cap = Capture::from_device(device)?
            .promisc(false)
            .snaplen(snaplen)
            .timeout(timeout_ms)
            .open()?;
        info!("listening on {}", device);
        PcapSource::with_filter(cap, filter, true)
    }
}

impl PcapSource<Offline> {
    /// Replay a savefile through `filter`.
    pub fn open_file<P: AsRef<Path>>(file: P, filter: &str) -> Result<Self> {
        let cap = Capture::from_file(file.as_ref())?;
        info!("reading {}", file.as_ref().display());
        PcapSource::with_filter(cap, filter, false)
    }
}

impl<T: Activated + ?Sized> PcapSource<T> {
    fn with_filter(mut cap: Capture<T>, filter: &str, live: bool) -> Result<Self> {
        // see https://biot.com/capstats/bpf.html for filter syntax
        cap.filter(filter, true)?;
        info!("filter: {}", filter);
        let link = link_type(cap.get_datalink().0)?;
        Ok(PcapSource {
            cap,
            link,
            live,
            last_seen: UNIX_EPOCH,
        })
    }
}

fn link_type(dlt: i32) -> Result<LinkType> {
    match dlt {
        1 => Ok(LinkType::Ethernet),
        113 => Ok(LinkType::LinuxSll),
        12 | 14 | 101 | 228 | 229 => Ok(LinkType::RawIp),
        0 | 108 => Ok(LinkType::Null),
        other => Err(Error::UnsupportedLinkType(other)),
    }
}

impl<T: Activated + ?Sized> PacketSource for PcapSource<T> {
    fn link_type(&self) -> LinkType {
        self.link
    }

    fn next_packet(&mut self) -> Result<Next> {
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = UNIX_EPOCH
                    + Duration::from_secs(ts.tv_sec as u64)
                    + Duration::from_micros(ts.tv_usec as u64);
                self.last_seen = timestamp;
                Ok(Next::Packet(CapturedPacket {
                    data: packet.data.to_vec(),
                    timestamp,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Next::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(Next::Exhausted),
            Err(e) => Err(e.into()),
        }
    }

    fn now(&self) -> SystemTime {
        if self.live {
            SystemTime::now()
        } else {
            self.last_seen
        }
    }
}
