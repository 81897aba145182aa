//! 每个后端独占的可变状态：答案缓存 + 待答请求表（同一把读写锁），
//! 完成信号总线，以及周期清理任务。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::merge::merge_dual_stack;
use super::message::{fqdn, RCode};
use super::record::{AnswerRecord, Eviction, LookupResult, RecordCache};
use super::signal::{wait_optional, SignalBus};
use super::{Family, IpOption};
use crate::common::context::QueryContext;
use crate::common::error::DnsError;

/// 调用方未指定截止时间时的单次查询时限
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// 清理任务周期
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// 未应答的 UDP 请求存活时长
pub const PENDING_REQUEST_TTL: Duration = Duration::from_secs(8);

/// 已发出、等待应答的线路请求（仅 UDP 后端使用）
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u16,
    pub family: Family,
    pub domain: String,
    pub expire_at: Instant,
    pub msg: Bytes,
}

impl PendingRequest {
    pub fn new(id: u16, family: Family, domain: String, msg: Bytes) -> Self {
        Self {
            id,
            family,
            domain,
            expire_at: Instant::now() + PENDING_REQUEST_TTL,
            msg,
        }
    }
}

#[derive(Debug, Default)]
pub struct Tables {
    pub cache: RecordCache,
    pub pending: HashMap<u16, PendingRequest>,
}

impl Tables {
    fn is_empty(&self) -> bool {
        self.cache.is_empty() && self.pending.is_empty()
    }
}

pub struct ResolverState {
    name: String,
    tables: RwLock<Tables>,
    bus: SignalBus,
    janitor_running: AtomicBool,
}

/// 响应码错误的 (rcode, 到期时间)，用于判断合并结果来自哪条记录
fn rcode_of(result: &LookupResult) -> Option<(RCode, Instant)> {
    match result {
        Err(DnsError::ResponseCode { rcode, expire_at }) => Some((*rcode, *expire_at)),
        _ => None,
    }
}

fn topic(domain: &str, family: Family) -> String {
    format!("{}{}", domain, family.tag())
}

impl ResolverState {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tables: RwLock::new(Tables::default()),
            bus: SignalBus::new(),
            janitor_running: AtomicBool::new(false),
        })
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub async fn insert_pending(self: &Arc<Self>, req: PendingRequest) {
        self.tables.write().await.pending.insert(req.id, req);
        self.ensure_janitor();
    }

    pub async fn take_pending(&self, id: u16) -> Option<PendingRequest> {
        self.tables.write().await.pending.remove(&id)
    }

    pub async fn pending_len(&self) -> usize {
        self.tables.read().await.pending.len()
    }

    pub async fn cached(&self, domain: &str, family: Family) -> Option<Arc<AnswerRecord>> {
        self.tables.read().await.cache.get(&fqdn(domain), family)
    }

    /// 写入记录（仅当更新时生效），随后通知该 topic 的等待者
    pub async fn store(self: &Arc<Self>, domain: &str, family: Family, record: AnswerRecord) {
        let addrs = record.addrs.len();
        let rcode = record.rcode;
        let replaced = self.tables.write().await.cache.store(domain, family, record);
        debug!(
            server = %self.name,
            domain = domain,
            family = ?family,
            rcode = %rcode,
            addrs = addrs,
            replaced = replaced,
            "DNS record updated"
        );
        self.bus.publish(&topic(domain, family));
        self.ensure_janitor();
    }

    /// 读取缓存并按选项合并双栈结果；`domain` 必须已规范化
    ///
    /// 临时失败记录只在其错误确实作为结果返回时才作废，
    /// 被另一族的答案或等待状态掩盖时保留，留给后续轮询或清理任务。
    pub async fn find_ips(&self, domain: &str, option: IpOption) -> LookupResult {
        let mut evictions = Vec::new();
        let (v4, v6) = {
            let tables = self.tables.read().await;
            let mut peek = |family: Family| {
                let (result, eviction) = tables.cache.peek(domain, family);
                if eviction != Eviction::None {
                    evictions.push((family, eviction, rcode_of(&result)));
                }
                result
            };
            let v4 = option.ipv4_enable.then(|| peek(Family::V4));
            let v6 = option.ipv6_enable.then(|| peek(Family::V6));
            (v4, v6)
        };

        let result = match (v4, v6) {
            (Some(v4), Some(v6)) => merge_dual_stack(v4, v6),
            (Some(single), None) | (None, Some(single)) => single,
            (None, None) => Err(DnsError::EmptyResponse),
        };

        let surfaced = rcode_of(&result);
        evictions.retain(|(_, eviction, rcode)| {
            *eviction != Eviction::Consumed || (rcode.is_some() && *rcode == surfaced)
        });
        if !evictions.is_empty() {
            let mut tables = self.tables.write().await;
            for (family, eviction, _) in evictions {
                tables.cache.evict(domain, family, eviction);
            }
        }

        result
    }

    /// 缓存查询 → 订阅 → 发出查询 → 每次被唤醒后重查缓存，直到得到结果、取消或超时
    pub async fn resolve<F, Fut>(
        &self,
        ctx: &QueryContext,
        domain: &str,
        option: IpOption,
        bypass_cache: bool,
        send: F,
    ) -> LookupResult
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), DnsError>>,
    {
        if !option.any_family() {
            return Err(DnsError::EmptyResponse);
        }
        let domain = fqdn(domain);

        if !bypass_cache {
            match self.find_ips(&domain, option).await {
                Err(DnsError::RecordNotFound) => {}
                result => {
                    debug!(server = %self.name, domain = %domain, "DNS cache hit");
                    return result;
                }
            }
        }

        let mut sub4 = option
            .ipv4_enable
            .then(|| self.bus.subscribe(topic(&domain, Family::V4)));
        let mut sub6 = option
            .ipv6_enable
            .then(|| self.bus.subscribe(topic(&domain, Family::V6)));

        send(domain.clone()).await?;

        let deadline = ctx.deadline_or(DEFAULT_QUERY_TIMEOUT);
        let mut wait_first = bypass_cache;
        loop {
            if !wait_first {
                match self.find_ips(&domain, option).await {
                    Err(DnsError::RecordNotFound) => {}
                    result => return result,
                }
            }
            wait_first = false;

            tokio::select! {
                _ = ctx.cancelled() => return Err(DnsError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(server = %self.name, domain = %domain, "DNS query deadline exceeded");
                    return Err(DnsError::Timeout);
                }
                _ = wait_optional(&mut sub4) => {}
                _ = wait_optional(&mut sub6) => {}
            }
        }
    }

    /// 清理过期缓存与超时的待答请求，返回剩余条目数
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut tables = self.tables.write().await;
        let removed = tables.cache.sweep(now);
        let before = tables.pending.len();
        tables.pending.retain(|_, req| req.expire_at > now);
        let expired = before - tables.pending.len();
        if removed > 0 || expired > 0 {
            debug!(
                server = %self.name,
                removed_records = removed,
                expired_requests = expired,
                "DNS cache cleanup"
            );
        }
        tables.cache.len() + tables.pending.len()
    }

    /// 启动周期清理；已在运行时为空操作，表为空时任务自行退出
    pub fn ensure_janitor(self: &Arc<Self>) {
        if self.janitor_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await; // 跳过首次立即触发
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                if state.sweep().await > 0 {
                    continue;
                }
                state.janitor_running.store(false, Ordering::Release);
                // 停止期间可能有新的写入，且其未能启动新的清理任务
                if state.tables.read().await.is_empty()
                    || state.janitor_running.swap(true, Ordering::AcqRel)
                {
                    break;
                }
            }
        });
    }

    pub fn janitor_running(&self) -> bool {
        self.janitor_running.load(Ordering::Acquire)
    }
}
