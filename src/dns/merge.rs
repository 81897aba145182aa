//! IPv4/IPv6 双栈结果合并
//!
//! 优先级："已有答案" > "仍在等待" > "确定失败"，
//! 轮询中的调用方不会在另一族查询尚未返回时过早拿到错误。

use super::record::{IpAnswer, LookupResult};
use crate::common::error::DnsError;

pub fn merge_dual_stack(v4: LookupResult, v6: LookupResult) -> LookupResult {
    match (v4, v6) {
        (Ok(a), Ok(b)) => {
            let mut addrs = a.addrs;
            addrs.extend(b.addrs);
            Ok(IpAnswer {
                addrs,
                expire_at: a.expire_at.min(b.expire_at),
            })
        }
        (Ok(a), Err(e)) | (Err(e), Ok(a)) if !matches!(e, DnsError::RecordNotFound) => Ok(a),
        (Err(DnsError::EmptyResponse), Err(DnsError::EmptyResponse)) => {
            Err(DnsError::EmptyResponse)
        }
        (Err(DnsError::RecordNotFound), _) | (_, Err(DnsError::RecordNotFound)) => {
            Err(DnsError::RecordNotFound)
        }
        (_, Err(e6)) => Err(e6),
        // 上面的分支已覆盖 v6 成功的所有情形
        (Err(e4), Ok(_)) => Err(e4),
    }
}
