//! 各传输协议的 DNS 后端，均实现 [`NameServer`](super::NameServer)

pub mod doh;
pub mod fakedns;
pub mod local;
pub mod tcp;
pub mod udp;

pub use doh::{DnsExchange, DohNameServer, H3Exchange, ReqwestExchange};
pub use fakedns::{FakeIpAllocator, FakeNameServer};
pub use local::LocalNameServer;
pub use tcp::TcpNameServer;
pub use udp::UdpNameServer;
