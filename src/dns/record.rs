use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use super::message::RCode;
use super::Family;
use crate::common::error::DnsError;

/// 单个后端对某个 (域名, 地址族) 的解析结果；存入缓存后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRecord {
    pub req_id: u16,
    pub addrs: Vec<IpAddr>,
    pub expire_at: Instant,
    pub rcode: RCode,
    /// 0 表示"需要重新验证"
    pub ttl_seconds: u32,
}

impl AnswerRecord {
    pub fn new(addrs: Vec<IpAddr>, ttl_seconds: u32) -> Self {
        Self {
            req_id: 0,
            addrs,
            expire_at: Instant::now() + std::time::Duration::from_secs(ttl_seconds as u64),
            rcode: RCode::NoError,
            ttl_seconds,
        }
    }

    /// 非 NoError/NXDomain 且 TTL 为 0：读过一次即作废
    fn is_transient_failure(&self) -> bool {
        !self.rcode.is_definite() && self.ttl_seconds == 0
    }
}

/// 解析得到的地址及其到期时间
#[derive(Debug, Clone, PartialEq)]
pub struct IpAnswer {
    pub addrs: Vec<IpAddr>,
    pub expire_at: Instant,
}

pub type LookupResult = Result<IpAnswer, DnsError>;

/// `candidate` 是否应替换 `existing`
pub fn is_newer(existing: Option<&AnswerRecord>, candidate: &AnswerRecord) -> bool {
    match existing {
        None => true,
        Some(old) => candidate.expire_at > old.expire_at,
    }
}

#[derive(Debug, Default, Clone)]
struct RecordPair {
    v4: Option<Arc<AnswerRecord>>,
    v6: Option<Arc<AnswerRecord>>,
}

impl RecordPair {
    fn slot(&self, family: Family) -> Option<&Arc<AnswerRecord>> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    fn slot_mut(&mut self, family: Family) -> &mut Option<Arc<AnswerRecord>> {
        match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        }
    }

    fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

/// 读缓存后需要执行的清理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    None,
    /// 已过期的槽位
    Expired,
    /// 读过一次的临时失败
    Consumed,
}

/// 按域名 + 地址族存储答案。本身不加锁，由所属后端的读写锁保护。
#[derive(Debug, Default)]
pub struct RecordCache {
    entries: HashMap<String, RecordPair>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, domain: &str, family: Family) -> Option<Arc<AnswerRecord>> {
        self.entries.get(domain)?.slot(family).cloned()
    }

    /// 只读查询；返回结果以及调用方在写锁下应执行的清理
    pub fn peek(&self, domain: &str, family: Family) -> (LookupResult, Eviction) {
        let Some(record) = self.entries.get(domain).and_then(|p| p.slot(family)) else {
            return (Err(DnsError::RecordNotFound), Eviction::None);
        };

        if record.ttl_seconds > 0 && record.expire_at <= Instant::now() {
            return (Err(DnsError::RecordNotFound), Eviction::Expired);
        }

        if record.rcode != RCode::NoError {
            let eviction = if record.is_transient_failure() {
                Eviction::Consumed
            } else {
                Eviction::None
            };
            return (
                Err(DnsError::ResponseCode {
                    rcode: record.rcode,
                    expire_at: record.expire_at,
                }),
                eviction,
            );
        }

        if record.addrs.is_empty() {
            return (Err(DnsError::EmptyResponse), Eviction::None);
        }

        (
            Ok(IpAnswer {
                addrs: record.addrs.clone(),
                expire_at: record.expire_at,
            }),
            Eviction::None,
        )
    }

    /// 查询并就地清理
    pub fn lookup(&mut self, domain: &str, family: Family) -> LookupResult {
        let (result, eviction) = self.peek(domain, family);
        if eviction != Eviction::None {
            self.evict(domain, family, eviction);
        }
        result
    }

    /// 按 `peek` 给出的理由移除槽位；写锁重新获取期间槽位可能已被替换，需复核
    pub fn evict(&mut self, domain: &str, family: Family, reason: Eviction) {
        let Some(pair) = self.entries.get_mut(domain) else {
            return;
        };
        let slot = pair.slot_mut(family);
        let still_due = match (reason, slot.as_deref()) {
            (Eviction::Expired, Some(r)) => r.ttl_seconds > 0 && r.expire_at <= Instant::now(),
            (Eviction::Consumed, Some(r)) => r.is_transient_failure(),
            _ => false,
        };
        if still_due {
            debug!(domain = domain, family = ?family, reason = ?reason, "DNS cache slot evicted");
            *slot = None;
            if pair.is_empty() {
                self.entries.remove(domain);
            }
        }
    }

    /// 仅当新记录更新时替换；返回是否替换
    pub fn store(&mut self, domain: &str, family: Family, record: AnswerRecord) -> bool {
        let pair = self.entries.entry(domain.to_string()).or_default();
        let slot = pair.slot_mut(family);
        if !is_newer(slot.as_deref(), &record) {
            return false;
        }
        *slot = Some(Arc::new(record));
        true
    }

    /// 清理所有已过期的槽位，返回移除的数量
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, pair| {
            for family in [Family::V4, Family::V6] {
                let slot = pair.slot_mut(family);
                if slot.as_ref().is_some_and(|r| r.expire_at <= now) {
                    *slot = None;
                    removed += 1;
                }
            }
            !pair.is_empty()
        });
        removed
    }
}
