use crate::error::Error;
use ::bitcoin::{Amount, FeeRate};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How quickly a transaction should confirm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationTarget {
    Fast,
    #[default]
    Medium,
    Slow,
}

impl fmt::Display for ConfirmationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationTarget::Fast => write!(f, "fast"),
            ConfirmationTarget::Medium => write!(f, "medium"),
            ConfirmationTarget::Slow => write!(f, "slow"),
        }
    }
}

impl FromStr for ConfirmationTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(ConfirmationTarget::Fast),
            "medium" => Ok(ConfirmationTarget::Medium),
            "slow" => Ok(ConfirmationTarget::Slow),
            other => bail!("Unknown confirmation target {}", other),
        }
    }
}

/// Source of fee rates when the caller does not name one.
pub trait FeePolicy: Send + Sync {
    fn fee_rate(&self, target: ConfirmationTarget) -> FeeRate;
}

/// Fixed rates per target, read from the `[fees]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticFeePolicy {
    fast: FeeRate,
    medium: FeeRate,
    slow: FeeRate,
}

impl StaticFeePolicy {
    pub fn from_sat_per_vb(fast: u64, medium: u64, slow: u64) -> Result<Self> {
        if !(fast >= medium && medium >= slow) {
            bail!(
                "Fee rates must not increase with the confirmation target, got {}/{}/{} sat/vB",
                fast,
                medium,
                slow
            )
        }

        let rate = |sat_per_vb: u64| {
            FeeRate::from_sat_per_vb(sat_per_vb)
                .with_context(|| format!("Fee rate of {} sat/vB is out of range", sat_per_vb))
        };

        Ok(Self {
            fast: rate(fast)?,
            medium: rate(medium)?,
            slow: rate(slow)?,
        })
    }
}

impl FeePolicy for StaticFeePolicy {
    fn fee_rate(&self, target: ConfirmationTarget) -> FeeRate {
        match target {
            ConfirmationTarget::Fast => self.fast,
            ConfirmationTarget::Medium => self.medium,
            ConfirmationTarget::Slow => self.slow,
        }
    }
}

/// How the builder decides the fee of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeChoice {
    Policy(ConfirmationTarget),
    Rate(FeeRate),
    Absolute(Amount),
}

impl Default for FeeChoice {
    fn default() -> Self {
        FeeChoice::Policy(ConfirmationTarget::default())
    }
}

impl FeeChoice {
    /// Fee for a transaction of `vsize` virtual bytes, never below
    /// `min_fee`. An absolute fee under the minimum is refused instead of
    /// raised.
    pub fn resolve(&self, policy: &dyn FeePolicy, vsize: u64, min_fee: Amount) -> Result<Amount> {
        let rate = match *self {
            FeeChoice::Absolute(fee) if fee < min_fee => bail!(Error::FeeTooLow {
                minimum: min_fee,
                actual: fee,
            }),
            FeeChoice::Absolute(fee) => return Ok(fee),
            FeeChoice::Rate(rate) => rate,
            FeeChoice::Policy(target) => policy.fee_rate(target),
        };

        let estimate = rate
            .fee_vb(vsize)
            .with_context(|| format!("Fee for {} vB at {} overflows", vsize, rate))?;

        Ok(estimate.max(min_fee))
    }
}
