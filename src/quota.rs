//! 传输大小配额判定。

/// 配额判定结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaDecision {
    Continue,
    Abort(QuotaBreach),
}

/// 触发中止的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaBreach {
    /// 客户端声明的总大小超出上限。
    Declared { declared: u64, ceiling: u64 },
    /// 服务端实际累计的字节数超出上限。
    Observed { observed: u64, ceiling: u64 },
}

#[derive(Clone, Copy, Debug)]
pub struct QuotaEnforcer {
    default_ceiling: u64,
}

impl QuotaEnforcer {
    /// `default_ceiling` 为 0 表示不限制。
    pub fn new(default_ceiling: u64) -> Self {
        Self { default_ceiling }
    }

    pub fn ceiling(&self, override_ceiling: Option<u64>) -> u64 {
        override_ceiling.unwrap_or(self.default_ceiling)
    }

    /// Observed size is authoritative; the declared size only lets an upload fail early.
    pub fn check(
        &self,
        observed: u64,
        declared: Option<u64>,
        override_ceiling: Option<u64>,
    ) -> QuotaDecision {
        let ceiling = self.ceiling(override_ceiling);
        if ceiling == 0 {
            return QuotaDecision::Continue;
        }
        if observed > ceiling {
            return QuotaDecision::Abort(QuotaBreach::Observed { observed, ceiling });
        }
        if let Some(declared) = declared
            && declared > ceiling
        {
            return QuotaDecision::Abort(QuotaBreach::Declared { declared, ceiling });
        }
        QuotaDecision::Continue
    }
}
