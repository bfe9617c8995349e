// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attempt budgets.
//!
//! Configuration historically used `0` both for "unlimited" and "no attempts
//! left". Internally the two never share a representation: a budget is either
//! [`Attempts::Unlimited`] or a finite count, where `Limited(0)` always means
//! exhausted.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    Unlimited,
    Limited(u32),
}

impl Attempts {
    /// Maps the `max_retries` config value: negative means unlimited, otherwise
    /// the first attempt plus `max_retries` retries. A budget is therefore
    /// never configured as zero attempts; "0 attempts means unlimited" is
    /// expressed as a negative `max_retries`.
    pub fn from_max_retries(max_retries: i64) -> Self {
        if max_retries < 0 {
            return Attempts::Unlimited;
        }
        let retries = u32::try_from(max_retries).unwrap_or(u32::MAX);
        Attempts::Limited(retries.saturating_add(1))
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Attempts::Unlimited)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Attempts::Limited(0))
    }

    /// Spends one attempt. Unlimited budgets are left untouched.
    pub fn consume(&mut self) {
        if let Attempts::Limited(left) = self {
            *left = left.saturating_sub(1);
        }
    }

    /// Whether another attempt may be made after `used` attempts.
    pub fn allows(&self, used: u32) -> bool {
        match self {
            Attempts::Unlimited => true,
            Attempts::Limited(max) => used < *max,
        }
    }
}

impl fmt::Display for Attempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempts::Unlimited => write!(f, "unlimited"),
            Attempts::Limited(n) => write!(f, "{n}"),
        }
    }
}
