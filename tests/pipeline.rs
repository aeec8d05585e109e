use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use stream_sniffer::capture::{CapturedPacket, Next, PacketSource};
use stream_sniffer::config::Config;
use stream_sniffer::dispatch::Dispatcher;
use stream_sniffer::error::Result;
use stream_sniffer::flow::{LinkType, StreamKey};
use stream_sniffer::plugin::{self, CommandSink, DecodedCommand};

/// Replays Linux cooked capture frames from memory.
struct Replay {
    packets: VecDeque<CapturedPacket>,
    now: SystemTime,
}

impl PacketSource for Replay {
    fn link_type(&self) -> LinkType {
        LinkType::LinuxSll
    }

    fn next_packet(&mut self) -> Result<Next> {
        Ok(match self.packets.pop_front() {
            Some(packet) => {
                self.now = packet.timestamp;
                Next::Packet(packet)
            }
            None => Next::Exhausted,
        })
    }

    fn now(&self) -> SystemTime {
        self.now
    }
}

#[derive(Default)]
struct Printed(Mutex<Vec<(SocketAddr, String)>>);

impl CommandSink for Printed {
    fn emit(&self, key: &StreamKey, command: &DecodedCommand) {
        self.0.lock().unwrap().push((key.src(), command.to_string()));
    }
}

fn sll_ipv6_tcp(
    src: SocketAddrV6,
    dst: SocketAddrV6,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = vec![0, 0, 0, 1, 0, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0x86, 0xdd];
    frame.extend_from_slice(&[0x60, 0, 0, 0]);
    frame.extend_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    frame.extend_from_slice(&[6, 64]);
    frame.extend_from_slice(&src.ip().octets());
    frame.extend_from_slice(&dst.ip().octets());
    frame.extend_from_slice(&src.port().to_be_bytes());
    frame.extend_from_slice(&dst.port().to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&[0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
    frame.extend_from_slice(payload);
    frame
}

fn packet(secs: u64, data: Vec<u8>) -> CapturedPacket {
    CapturedPacket {
        data,
        timestamp: UNIX_EPOCH + Duration::from_secs(secs),
    }
}

#[test]
fn redis_commands_over_ipv6() {
    let server = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 7000, 0, 0);
    let client = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 41000, 0, 0);
    const SYN: u8 = 0x02;
    const PSH_ACK: u8 = 0x18;
    const FIN_ACK: u8 = 0x11;

    let request: &[u8] =
        b"garbage before the first frame\r\n*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
    let (head, tail) = request.split_at(40);
    let get = b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n";
    let get_seq = 1001 + request.len() as u32;
    let packets = vec![
        packet(0, sll_ipv6_tcp(client, server, 1000, SYN, b"")),
        packet(0, sll_ipv6_tcp(server, client, 9000, SYN | 0x10, b"")),
        packet(1, sll_ipv6_tcp(client, server, 1001 + 40, PSH_ACK, tail)),
        packet(1, sll_ipv6_tcp(client, server, 1001, PSH_ACK, head)),
        packet(1, sll_ipv6_tcp(server, client, 9001, PSH_ACK, b"*1\r\n$2\r\nOK\r\n")),
        packet(2, sll_ipv6_tcp(client, server, get_seq, PSH_ACK, get)),
        // cut off mid frame by the FIN
        packet(3, sll_ipv6_tcp(client, server, get_seq + 22, FIN_ACK, b"*1\r\n$4\r\n")),
    ];

    let mut redis = plugin::lookup("redis").unwrap();
    redis.set_flags(&["-p".to_string(), "7000".to_string()]).unwrap();
    let printed = Arc::new(Printed::default());
    let sink: Arc<dyn CommandSink> = printed.clone();
    let source = Replay {
        packets: packets.into(),
        now: UNIX_EPOCH,
    };

    let mut dispatcher = Dispatcher::new(source, Arc::from(redis), sink, &Config::default());
    let stats = dispatcher.run().unwrap();

    assert_eq!(stats.packets, 7);
    assert_eq!(stats.skipped, 0);
    let printed = printed.0.lock().unwrap().clone();
    assert_eq!(
        printed,
        vec![
            (SocketAddr::V6(client), "SET key value".to_string()),
            (SocketAddr::V6(client), "GET key".to_string()),
        ]
    );
}
