//! EDNS Client Subnet (ECS) option 编码 (RFC 7871)

use std::net::IpAddr;

/// ECS option code in EDNS OPT RR
pub const ECS_OPTION_CODE: u16 = 8;

/// 查询中附带客户端地址时使用的固定源前缀长度
pub const CLIENT_SUBNET_V4_PREFIX: u8 = 24;
pub const CLIENT_SUBNET_V6_PREFIX: u8 = 96;

#[derive(Debug, Clone, PartialEq)]
pub struct EcsOption {
    /// Address family: 1 = IPv4, 2 = IPv6
    pub family: u16,
    pub source_prefix_length: u8,
    /// 查询中恒为 0
    pub scope_prefix_length: u8,
    pub address: IpAddr,
}

impl EcsOption {
    /// 由客户端 IP 构造：IPv4 取 /24，IPv6 取 /96
    pub fn from_client_ip(ip: IpAddr) -> Self {
        let (family, prefix) = match ip {
            IpAddr::V4(_) => (1, CLIENT_SUBNET_V4_PREFIX),
            IpAddr::V6(_) => (2, CLIENT_SUBNET_V6_PREFIX),
        };
        Self {
            family,
            source_prefix_length: prefix,
            scope_prefix_length: 0,
            address: ip,
        }
    }

    /// 编码为 option-data；地址只保留覆盖前缀所需的最少字节
    pub fn encode(&self) -> Vec<u8> {
        let addr_bytes = match self.address {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let prefix_bytes = (self.source_prefix_length as usize + 7) / 8;
        let mut truncated = addr_bytes[..prefix_bytes.min(addr_bytes.len())].to_vec();
        // 前缀之外的位清零
        let rem = self.source_prefix_length % 8;
        if rem != 0 {
            if let Some(last) = truncated.last_mut() {
                *last &= 0xFFu8 << (8 - rem);
            }
        }

        let mut buf = Vec::with_capacity(4 + truncated.len());
        buf.extend_from_slice(&self.family.to_be_bytes());
        buf.push(self.source_prefix_length);
        buf.push(self.scope_prefix_length);
        buf.extend_from_slice(&truncated);
        buf
    }
}

/// option-code + option-length + option-data，即 OPT RR 的 RDATA
pub fn build_ecs_opt_rdata(ecs: &EcsOption) -> Vec<u8> {
    let option_data = ecs.encode();
    let mut buf = Vec::with_capacity(4 + option_data.len());
    buf.extend_from_slice(&ECS_OPTION_CODE.to_be_bytes());
    buf.extend_from_slice(&(option_data.len() as u16).to_be_bytes());
    buf.extend_from_slice(&option_data);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_uses_fixed_prefixes() {
        let v4 = EcsOption::from_client_ip("203.0.113.77".parse().unwrap());
        assert_eq!(v4.encode(), vec![0, 1, 24, 0, 203, 0, 113]);

        let v6 = EcsOption::from_client_ip("2001:db8::1".parse().unwrap());
        let encoded = v6.encode();
        assert_eq!(&encoded[..4], &[0, 2, 96, 0]);
        assert_eq!(encoded.len(), 4 + 12);
    }

    #[test]
    fn encode_masks_partial_byte() {
        let ecs = EcsOption {
            source_prefix_length: 12,
            ..EcsOption::from_client_ip("10.255.1.2".parse().unwrap())
        };
        // 12 位前缀 → 2 字节，第二字节只保留高 4 位
        assert_eq!(ecs.encode(), vec![0, 1, 12, 0, 10, 0xF0]);
    }

    #[test]
    fn opt_rdata_layout() {
        let ecs = EcsOption::from_client_ip("1.2.3.4".parse().unwrap());
        let rdata = build_ecs_opt_rdata(&ecs);
        assert_eq!(u16::from_be_bytes([rdata[0], rdata[1]]), ECS_OPTION_CODE);
        assert_eq!(u16::from_be_bytes([rdata[2], rdata[3]]) as usize, rdata.len() - 4);
        assert_eq!(&rdata[4..], &[0, 1, 24, 0, 1, 2, 3]);
    }
}
