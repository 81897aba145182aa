//! DNS 报文编解码
//!
//! 与传输无关：构建 A/AAAA 查询（可附带 EDNS0 client-subnet），
//! 把应答解析成 [`AnswerRecord`]。

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use super::ecs::EcsOption;
use super::record::AnswerRecord;
use super::{Family, IpOption};
use crate::common::error::DnsError;

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

/// EDNS0 通告的 UDP 负载大小
pub const EDNS_UDP_PAYLOAD: u16 = 1350;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;

/// DNS 响应码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RCode {
    NoError,
    FormErr,
    ServFail,
    NXDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl RCode {
    /// NoError 和 NXDomain 是可缓存的确定答案
    pub fn is_definite(self) -> bool {
        matches!(self, RCode::NoError | RCode::NXDomain)
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RCode::NoError => 0,
            RCode::FormErr => 1,
            RCode::ServFail => 2,
            RCode::NXDomain => 3,
            RCode::NotImp => 4,
            RCode::Refused => 5,
            RCode::Other(v) => v,
        }
    }
}

impl From<u8> for RCode {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            0 => RCode::NoError,
            1 => RCode::FormErr,
            2 => RCode::ServFail,
            3 => RCode::NXDomain,
            4 => RCode::NotImp,
            5 => RCode::Refused,
            other => RCode::Other(other),
        }
    }
}

impl fmt::Display for RCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RCode::NoError => f.write_str("NOERROR"),
            RCode::FormErr => f.write_str("FORMERR"),
            RCode::ServFail => f.write_str("SERVFAIL"),
            RCode::NXDomain => f.write_str("NXDOMAIN"),
            RCode::NotImp => f.write_str("NOTIMP"),
            RCode::Refused => f.write_str("REFUSED"),
            RCode::Other(v) => write!(f, "RCODE{}", v),
        }
    }
}

/// 待发送的单个地址族查询
#[derive(Debug, Clone)]
pub struct OutgoingQuery {
    pub id: u16,
    pub family: Family,
    pub domain: String,
    pub msg: Bytes,
}

/// 域名规范化：小写 + 末尾点
pub fn fqdn(domain: &str) -> String {
    let lower = domain.trim().to_ascii_lowercase();
    if lower.ends_with('.') {
        lower
    } else {
        format!("{}.", lower)
    }
}

/// 为每个启用的地址族构建一条查询，ID 由 `next_id` 独立生成
pub fn build_queries(
    domain: &str,
    option: IpOption,
    mut next_id: impl FnMut() -> u16,
    client_ip: Option<IpAddr>,
) -> Result<Vec<OutgoingQuery>, DnsError> {
    let domain = fqdn(domain);
    let ecs = client_ip.map(EcsOption::from_client_ip);

    let mut queries = Vec::with_capacity(2);
    for family in option.families() {
        let id = next_id();
        let msg = encode_query(id, &domain, family.qtype(), ecs.as_ref())?;
        queries.push(OutgoingQuery {
            id,
            family,
            domain: domain.clone(),
            msg,
        });
    }
    Ok(queries)
}

fn encode_query(
    id: u16,
    domain: &str,
    qtype: u16,
    ecs: Option<&EcsOption>,
) -> Result<Bytes, DnsError> {
    let mut buf = BytesMut::with_capacity(64);

    buf.put_u16(id);
    buf.put_u16(FLAG_RD);
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0); // ANCOUNT
    buf.put_u16(0); // NSCOUNT
    buf.put_u16(if ecs.is_some() { 1 } else { 0 }); // ARCOUNT

    put_name(&mut buf, domain)?;
    buf.put_u16(qtype);
    buf.put_u16(CLASS_IN);

    if let Some(ecs) = ecs {
        let rdata = super::ecs::build_ecs_opt_rdata(ecs);
        buf.put_u8(0); // root
        buf.put_u16(TYPE_OPT);
        buf.put_u16(EDNS_UDP_PAYLOAD);
        buf.put_u32(0); // extended rcode / version / flags
        buf.put_u16(rdata.len() as u16);
        buf.put_slice(&rdata);
    }

    Ok(buf.freeze())
}

fn put_name(buf: &mut BytesMut, domain: &str) -> Result<(), DnsError> {
    let trimmed = domain.trim_end_matches('.');
    if trimmed.len() > 253 {
        return Err(DnsError::Malformed(format!("domain too long: {}", domain)));
    }
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(DnsError::Malformed(format!("invalid label in {}", domain)));
            }
            buf.put_u8(label.len() as u8);
            buf.put_slice(label.as_bytes());
        }
    }
    buf.put_u8(0);
    Ok(())
}

/// 解析结果；`truncated` 为真时 `record` 只包含已解析出的部分
#[derive(Debug, Clone)]
pub struct ParsedAnswer {
    pub record: AnswerRecord,
    pub truncated: bool,
}

impl ParsedAnswer {
    pub fn into_record(self) -> Result<AnswerRecord, DnsError> {
        if self.truncated {
            Err(DnsError::Truncated)
        } else {
            Ok(self.record)
        }
    }
}

/// 解析应答报文
///
/// 每条 A/AAAA 记录都会覆盖 `ttl_seconds`/`expire_at`（最后一条生效）。
/// 无地址且响应码为 NoError/NXDomain 时，从 authority 段的 SOA 推导负缓存 TTL。
pub fn parse_answer(raw: &[u8]) -> Result<ParsedAnswer, DnsError> {
    let header = Header::read(raw)?;
    if header.flags & FLAG_QR == 0 {
        return Err(DnsError::Malformed("not a response".into()));
    }
    let truncated = header.flags & FLAG_TC != 0;
    let now = Instant::now();

    let mut record = AnswerRecord {
        req_id: header.id,
        addrs: Vec::new(),
        expire_at: now,
        rcode: RCode::from((header.flags & 0x000F) as u8),
        ttl_seconds: 0,
    };

    match parse_sections(raw, &header, now, &mut record) {
        Ok(()) => {}
        // 截断报文允许后半部分缺失
        Err(_) if truncated => {}
        Err(e) => return Err(e),
    }

    Ok(ParsedAnswer { record, truncated })
}

fn parse_sections(
    raw: &[u8],
    header: &Header,
    now: Instant,
    record: &mut AnswerRecord,
) -> Result<(), DnsError> {
    let mut pos = HEADER_LEN;
    for _ in 0..header.qdcount {
        pos = skip_name(raw, pos)?;
        pos = checked_advance(raw, pos, 4)?;
    }

    for _ in 0..header.ancount {
        let rr = ResourceHeader::read(raw, pos)?;
        let rdata = &raw[rr.rdata_start..rr.rdata_end];
        let addr = match (rr.rtype, rdata.len()) {
            (TYPE_A, 4) => Some(IpAddr::V4(Ipv4Addr::new(
                rdata[0], rdata[1], rdata[2], rdata[3],
            ))),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        };
        if let Some(addr) = addr {
            record.addrs.push(addr);
            record.ttl_seconds = rr.ttl;
            record.expire_at = now + Duration::from_secs(rr.ttl as u64);
        }
        pos = rr.rdata_end;
    }

    if !record.addrs.is_empty() || !record.rcode.is_definite() {
        return Ok(());
    }

    for _ in 0..header.nscount {
        let rr = ResourceHeader::read(raw, pos)?;
        if rr.rtype == TYPE_SOA {
            // MNAME RNAME SERIAL REFRESH RETRY EXPIRE MINIMUM
            let mut p = skip_name(raw, rr.rdata_start)?;
            p = skip_name(raw, p)?;
            let min_pos = checked_advance(raw, p, 16)?;
            if min_pos + 4 > rr.rdata_end {
                return Err(DnsError::Malformed("short SOA record".into()));
            }
            let minimum = read_u32(raw, min_pos);
            let ttl = rr.ttl.min(minimum);
            record.ttl_seconds = ttl;
            record.expire_at = now + Duration::from_secs(ttl as u64);
            break;
        }
        pos = rr.rdata_end;
    }
    Ok(())
}

struct Header {
    id: u16,
    flags: u16,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
}

impl Header {
    fn read(raw: &[u8]) -> Result<Self, DnsError> {
        if raw.len() < HEADER_LEN {
            return Err(DnsError::Malformed(format!(
                "message too short: {} bytes",
                raw.len()
            )));
        }
        Ok(Self {
            id: read_u16(raw, 0),
            flags: read_u16(raw, 2),
            qdcount: read_u16(raw, 4),
            ancount: read_u16(raw, 6),
            nscount: read_u16(raw, 8),
        })
    }
}

struct ResourceHeader {
    rtype: u16,
    ttl: u32,
    rdata_start: usize,
    rdata_end: usize,
}

impl ResourceHeader {
    fn read(raw: &[u8], pos: usize) -> Result<Self, DnsError> {
        let pos = skip_name(raw, pos)?;
        let rdata_start = checked_advance(raw, pos, 10)?;
        let rtype = read_u16(raw, pos);
        let ttl = read_u32(raw, pos + 4);
        let rdlen = read_u16(raw, pos + 8) as usize;
        let rdata_end = checked_advance(raw, rdata_start, rdlen)?;
        Ok(Self {
            rtype,
            ttl,
            rdata_start,
            rdata_end,
        })
    }
}

fn read_u16(raw: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([raw[pos], raw[pos + 1]])
}

fn read_u32(raw: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]])
}

fn checked_advance(raw: &[u8], pos: usize, n: usize) -> Result<usize, DnsError> {
    let end = pos + n;
    if end > raw.len() {
        return Err(DnsError::Malformed("unexpected end of message".into()));
    }
    Ok(end)
}

/// 跳过一个（可能被压缩的）域名，返回其后的位置
fn skip_name(raw: &[u8], mut pos: usize) -> Result<usize, DnsError> {
    loop {
        let len = *raw
            .get(pos)
            .ok_or_else(|| DnsError::Malformed("unexpected end of name".into()))?
            as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return checked_advance(raw, pos, 2);
        }
        pos = checked_advance(raw, pos + 1, len)?;
    }
}

/// 读取报文 ID
pub fn message_id(msg: &[u8]) -> Option<u16> {
    if msg.len() < 2 {
        return None;
    }
    Some(read_u16(msg, 0))
}

/// 原地改写报文 ID
pub fn set_message_id(msg: &mut [u8], id: u16) {
    if msg.len() >= 2 {
        msg[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// 解析出的 DNS 查询信息
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
    /// header 之后、answer 之前的完整 question section
    pub raw_question: Vec<u8>,
}

/// 从原始报文中解析第一个 question
pub fn parse_query(data: &[u8]) -> Result<DnsQuery, DnsError> {
    let header = Header::read(data)?;
    if header.flags & FLAG_QR != 0 {
        return Err(DnsError::Malformed("not a query".into()));
    }
    if header.qdcount == 0 {
        return Err(DnsError::Malformed("query without question".into()));
    }

    let mut pos = HEADER_LEN;
    let mut labels: Vec<String> = Vec::new();
    loop {
        let len = *data
            .get(pos)
            .ok_or_else(|| DnsError::Malformed("unexpected end of name".into()))?
            as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        // query 中不应出现指针压缩
        if len & 0xC0 != 0 {
            return Err(DnsError::Malformed("compressed name in question".into()));
        }
        let end = checked_advance(data, pos + 1, len)?;
        let label = std::str::from_utf8(&data[pos + 1..end])
            .map_err(|_| DnsError::Malformed("non-utf8 label".into()))?;
        labels.push(label.to_string());
        pos = end;
    }

    let end = checked_advance(data, pos, 4)?;
    let qtype = read_u16(data, pos);
    Ok(DnsQuery {
        id: header.id,
        name: fqdn(&labels.join(".")),
        qtype,
        raw_question: data[HEADER_LEN..end].to_vec(),
    })
}

/// 直接合成 A/AAAA 应答，仅包含与 qtype 匹配的地址
pub fn build_response(query: &DnsQuery, addrs: &[IpAddr], ttl: u32) -> Vec<u8> {
    let matched: Vec<&IpAddr> = addrs
        .iter()
        .filter(|addr| {
            matches!(
                (query.qtype, addr),
                (TYPE_A, IpAddr::V4(_)) | (TYPE_AAAA, IpAddr::V6(_))
            )
        })
        .collect();

    let mut resp = BytesMut::with_capacity(HEADER_LEN + query.raw_question.len() + 28 * matched.len());
    resp.put_u16(query.id);
    resp.put_u16(0x8180); // QR=1, RD=1, RA=1
    resp.put_u16(1);
    resp.put_u16(matched.len() as u16);
    resp.put_u16(0);
    resp.put_u16(0);
    resp.put_slice(&query.raw_question);

    for addr in matched {
        // 指针指向 question 中的域名
        resp.put_u16(0xC00C);
        match addr {
            IpAddr::V4(v4) => {
                resp.put_u16(TYPE_A);
                resp.put_u16(CLASS_IN);
                resp.put_u32(ttl);
                resp.put_u16(4);
                resp.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                resp.put_u16(TYPE_AAAA);
                resp.put_u16(CLASS_IN);
                resp.put_u32(ttl);
                resp.put_u16(16);
                resp.put_slice(&v6.octets());
            }
        }
    }
    resp.to_vec()
}


#[cfg(test)]
mod tests {
    use super::testing::ResponseBuilder;
    use super::*;

    fn counter() -> impl FnMut() -> u16 {
        let mut next = 100u16;
        move || {
            next += 1;
            next
        }
    }

    #[test]
    fn fqdn_normalizes() {
        assert_eq!(fqdn("Example.COM"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
    }

    #[test]
    fn build_queries_per_family() {
        let queries = build_queries("example.com", IpOption::dual(), counter(), None).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].family, Family::V4);
        assert_eq!(queries[1].family, Family::V6);
        assert_ne!(queries[0].id, queries[1].id);
        assert_eq!(message_id(&queries[0].msg), Some(queries[0].id));

        let msg = &queries[1].msg;
        // RD 置位，QDCOUNT=1，ARCOUNT=0
        assert_eq!(read_u16(msg, 2), FLAG_RD);
        assert_eq!(read_u16(msg, 4), 1);
        assert_eq!(read_u16(msg, 10), 0);
        assert_eq!(read_u16(msg, msg.len() - 4), TYPE_AAAA);

        let v4_only = build_queries("example.com", IpOption::ipv4_only(), counter(), None).unwrap();
        assert_eq!(v4_only.len(), 1);
        assert!(build_queries("example.com", IpOption::default(), counter(), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn client_subnet_v4_encoding() {
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let queries =
            build_queries("example.com", IpOption::ipv4_only(), counter(), Some(ip)).unwrap();
        let msg = &queries[0].msg;
        assert_eq!(read_u16(msg, 10), 1);

        // OPT RR 位于报文末尾：name(1) type(2) class(2) ttl(4) rdlen(2) + rdata
        // rdata = code(2) len(2) family(2) source(1) scope(1) addr(3)
        let rdata = &msg[msg.len() - 11..];
        assert_eq!(rdata, &[0, 8, 0, 7, 0, 1, 24, 0, 1, 2, 3]);
        let opt = &msg[msg.len() - 22..msg.len() - 11];
        assert_eq!(opt[0], 0);
        assert_eq!(read_u16(opt, 1), TYPE_OPT);
        assert_eq!(read_u16(opt, 3), EDNS_UDP_PAYLOAD);
        assert_eq!(read_u16(opt, 9), 11);
    }

    #[test]
    fn client_subnet_v6_encoding() {
        let ip: IpAddr = "2001:db8:1:2:3:4:5:6".parse().unwrap();
        let queries =
            build_queries("example.com", IpOption::ipv6_only(), counter(), Some(ip)).unwrap();
        let msg = &queries[0].msg;
        let rdata = &msg[msg.len() - 20..];
        assert_eq!(&rdata[..8], &[0, 8, 0, 16, 0, 2, 96, 0]);
        assert_eq!(&rdata[8..], &[0x20, 0x01, 0x0d, 0xb8, 0, 1, 0, 2, 0, 3, 0, 4]);
    }

    #[test]
    fn rejects_oversized_label() {
        let label = "a".repeat(64);
        let err = build_queries(&format!("{}.com", label), IpOption::ipv4_only(), counter(), None)
            .unwrap_err();
        assert!(matches!(err, DnsError::Malformed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn parse_single_a_record() {
        let queries = build_queries("example.com.", IpOption::ipv4_only(), counter(), None).unwrap();
        let resp = ResponseBuilder::for_query(&queries[0].msg)
            .answer("93.184.216.34".parse().unwrap(), 300)
            .build();

        let parsed = parse_answer(&resp).unwrap();
        assert!(!parsed.truncated);
        let record = parsed.into_record().unwrap();
        assert_eq!(record.req_id, queries[0].id);
        assert_eq!(record.addrs, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        assert_eq!(record.ttl_seconds, 300);
        assert_eq!(record.rcode, RCode::NoError);
        assert_eq!(record.expire_at, Instant::now() + Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn last_answer_ttl_wins() {
        // 取最后一条记录的 TTL，而不是最小值
        let resp = ResponseBuilder::new(1, "example.com", TYPE_A)
            .cname("edge.example.net", 30)
            .answer("1.1.1.1".parse().unwrap(), 60)
            .answer("1.0.0.1".parse().unwrap(), 600)
            .build();
        let record = parse_answer(&resp).unwrap().into_record().unwrap();
        assert_eq!(record.addrs.len(), 2);
        assert_eq!(record.ttl_seconds, 600);
        assert_eq!(record.expire_at, Instant::now() + Duration::from_secs(600));
    }

    #[test]
    fn truncated_flag_yields_truncated() {
        let resp = ResponseBuilder::new(7, "big.example.com", TYPE_A)
            .answer("10.0.0.1".parse().unwrap(), 60)
            .truncated()
            .build();
        let parsed = parse_answer(&resp).unwrap();
        assert!(parsed.truncated);
        assert_eq!(parsed.record.addrs.len(), 1);
        assert!(matches!(parsed.into_record(), Err(DnsError::Truncated)));

        // 截断且答案区残缺时同样返回 Truncated
        let mut resp = ResponseBuilder::new(7, "big.example.com", TYPE_A)
            .answer("10.0.0.1".parse().unwrap(), 60)
            .answer("10.0.0.2".parse().unwrap(), 60)
            .truncated()
            .build();
        resp.truncate(resp.len() - 6);
        let parsed = parse_answer(&resp).unwrap();
        assert!(parsed.truncated);
        assert!(matches!(parsed.into_record(), Err(DnsError::Truncated)));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_ttl_from_soa() {
        let resp = ResponseBuilder::new(3, "missing.example.com", TYPE_A)
            .rcode(RCode::NXDomain)
            .soa(900, 120)
            .build();
        let record = parse_answer(&resp).unwrap().into_record().unwrap();
        assert!(record.addrs.is_empty());
        assert_eq!(record.rcode, RCode::NXDomain);
        assert_eq!(record.ttl_seconds, 120);
        assert_eq!(record.expire_at, Instant::now() + Duration::from_secs(120));

        let resp = ResponseBuilder::new(3, "empty.example.com", TYPE_AAAA)
            .soa(60, 3600)
            .build();
        let record = parse_answer(&resp).unwrap().into_record().unwrap();
        assert_eq!(record.ttl_seconds, 60);
    }

    #[test]
    fn servfail_ignores_soa() {
        let resp = ResponseBuilder::new(4, "broken.example.com", TYPE_A)
            .rcode(RCode::ServFail)
            .soa(900, 120)
            .build();
        let record = parse_answer(&resp).unwrap().into_record().unwrap();
        assert_eq!(record.rcode, RCode::ServFail);
        assert_eq!(record.ttl_seconds, 0);
    }

    #[test]
    fn malformed_messages_rejected() {
        assert!(matches!(parse_answer(&[0u8; 5]), Err(DnsError::Malformed(_))));

        // QR=0 不是应答
        let queries = build_queries("a.com", IpOption::ipv4_only(), counter(), None).unwrap();
        assert!(parse_answer(&queries[0].msg).is_err());

        let mut resp = ResponseBuilder::new(1, "example.com", TYPE_A)
            .answer("1.2.3.4".parse().unwrap(), 60)
            .build();
        resp.truncate(resp.len() - 2);
        assert!(matches!(parse_answer(&resp), Err(DnsError::Malformed(_))));
    }

    #[test]
    fn query_parse_and_synthesized_response() {
        let queries = build_queries("fake.example", IpOption::dual(), counter(), None).unwrap();
        let query = parse_query(&queries[1].msg).unwrap();
        assert_eq!(query.name, "fake.example.");
        assert_eq!(query.qtype, TYPE_AAAA);
        assert_eq!(query.id, queries[1].id);

        let addrs: Vec<IpAddr> = vec!["198.18.0.1".parse().unwrap(), "fc00::1".parse().unwrap()];
        let resp = build_response(&query, &addrs, 1);
        let record = parse_answer(&resp).unwrap().into_record().unwrap();
        assert_eq!(record.req_id, query.id);
        assert_eq!(record.addrs, vec!["fc00::1".parse::<IpAddr>().unwrap()]);
        assert_eq!(record.ttl_seconds, 1);
    }

    #[test]
    fn rewrite_message_id() {
        let mut msg = vec![0x12, 0x34, 0x01, 0x00];
        set_message_id(&mut msg, 0xBEEF);
        assert_eq!(message_id(&msg), Some(0xBEEF));
        assert_eq!(message_id(&[1]), None);
    }

    #[test]
    fn hickory_accepts_encoded_query() {
        use hickory_resolver::proto::op::Message;
        use hickory_resolver::proto::rr::RecordType;

        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let queries = build_queries("www.example.com", IpOption::dual(), counter(), Some(ip)).unwrap();
        let msg = Message::from_vec(&queries[1].msg).unwrap();
        assert_eq!(msg.id(), queries[1].id);
        assert!(msg.recursion_desired());
        assert_eq!(msg.queries()[0].query_type(), RecordType::AAAA);
        assert_eq!(msg.queries()[0].name().to_ascii(), "www.example.com.");
        assert!(msg.extensions().is_some());
    }
}
