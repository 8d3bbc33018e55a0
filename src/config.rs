#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */
/* Throttler and budget pool configuration */

use crate::error::{Result, ThrottlerError};
use crate::time::TimeDelta;

/// Default alignment of throttled wake-ups.
pub const DEFAULT_ALIGNMENT: TimeDelta = TimeDelta::from_secs(1);

/// Default recovery rate of a freshly created pool.
pub const DEFAULT_RECOVERY_RATE: f64 = 1.0;

/// Throttler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlerConfig {
    /// Name used in diagnostics
    pub name: String,
    /// Throttled wake-ups are rounded up to a multiple of this span
    pub alignment: TimeDelta,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            name: "renderer".to_string(),
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl ThrottlerConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.alignment <= TimeDelta::ZERO {
            return Err(ThrottlerError::InvalidConfig(format!(
                "alignment must be positive, got {}",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Budget pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetPoolConfig {
    /// Pool name
    pub name: String,
    /// Fraction of elapsed time credited to the budget
    pub recovery_rate: f64,
    /// Upper clamp on banked budget
    pub max_budget_level: Option<TimeDelta>,
    /// Bound on how long accrued debt may block the pool
    pub max_throttling_duration: Option<TimeDelta>,
    /// Budget granted at creation
    pub initial_budget: TimeDelta,
}

impl Default for BudgetPoolConfig {
    fn default() -> Self {
        Self {
            name: "budget_pool".to_string(),
            recovery_rate: DEFAULT_RECOVERY_RATE,
            max_budget_level: None,
            max_throttling_duration: None,
            initial_budget: TimeDelta::ZERO,
        }
    }
}

impl BudgetPoolConfig {
    /// Starts a builder for a pool called `name`.
    pub fn builder(name: impl Into<String>) -> BudgetPoolConfigBuilder {
        BudgetPoolConfigBuilder::new(name)
    }

    /// Validates rate and clamps.
    pub fn validate(&self) -> Result<()> {
        validate_limits(
            self.recovery_rate,
            self.max_budget_level,
            self.max_throttling_duration,
        )
    }
}

/// Checks a recovery rate against the pool's clamps.
///
/// Rejects rates that are not finite and positive, negative bounds, and a
/// ceiling below the debt floor `-max_throttling_duration * rate`.
pub fn validate_limits(
    recovery_rate: f64,
    max_budget_level: Option<TimeDelta>,
    max_throttling_duration: Option<TimeDelta>,
) -> Result<()> {
    if !recovery_rate.is_finite() || recovery_rate <= 0.0 {
        return Err(ThrottlerError::InvalidConfig(format!(
            "recovery rate must be positive and finite, got {recovery_rate}"
        )));
    }

    if let Some(duration) = max_throttling_duration {
        if duration.is_negative() {
            return Err(ThrottlerError::InvalidConfig(format!(
                "max_throttling_duration must not be negative, got {duration}"
            )));
        }
    }

    if let Some(ceiling) = max_budget_level {
        if let Some(duration) = max_throttling_duration {
            let floor = debt_floor(duration, recovery_rate);
            if ceiling < floor {
                return Err(ThrottlerError::InvalidConfig(format!(
                    "max_budget_level {ceiling} is below the debt floor {floor}"
                )));
            }
        }
        if ceiling.is_negative() {
            return Err(ThrottlerError::InvalidConfig(format!(
                "max_budget_level must not be negative, got {ceiling}"
            )));
        }
    }

    Ok(())
}

/// Lowest balance a pool bounded by `max_throttling_duration` may reach.
///
/// Rounded toward zero so that repaying the debt at `recovery_rate` never
/// takes longer than `max_throttling_duration`.
pub(crate) fn debt_floor(max_throttling_duration: TimeDelta, recovery_rate: f64) -> TimeDelta {
    let debt = (max_throttling_duration.as_micros() as f64 * recovery_rate).floor();
    TimeDelta::from_micros(-(debt as i64))
}

/// Builder for [`BudgetPoolConfig`].
#[derive(Debug, Clone)]
pub struct BudgetPoolConfigBuilder {
    config: BudgetPoolConfig,
}

impl BudgetPoolConfigBuilder {
    /// Creates a builder with default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: BudgetPoolConfig {
                name: name.into(),
                ..BudgetPoolConfig::default()
            },
        }
    }

    /// Sets the recovery rate.
    #[must_use]
    pub fn recovery_rate(mut self, rate: f64) -> Self {
        self.config.recovery_rate = rate;
        self
    }

    /// Sets the budget ceiling.
    #[must_use]
    pub fn max_budget_level(mut self, level: TimeDelta) -> Self {
        self.config.max_budget_level = Some(level);
        self
    }

    /// Bounds how long debt may block the pool.
    #[must_use]
    pub fn max_throttling_duration(mut self, duration: TimeDelta) -> Self {
        self.config.max_throttling_duration = Some(duration);
        self
    }

    /// Sets the budget granted at creation.
    #[must_use]
    pub fn initial_budget(mut self, budget: TimeDelta) -> Self {
        self.config.initial_budget = budget;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<BudgetPoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Preset budget pool configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetProfile {
    /// Background renderers: 1% CPU, 3s ceiling, 1s initial budget
    Background,
    /// Tight budget with a bounded blocking time
    Aggressive,
    /// Half of the CPU, small debt bound
    Permissive,
}

impl BudgetProfile {
    /// Creates the preset configuration for a pool named `name`.
    pub fn create_config(self, name: impl Into<String>) -> BudgetPoolConfig {
        let name = name.into();
        match self {
            Self::Background => BudgetPoolConfig {
                name,
                recovery_rate: 0.01,
                max_budget_level: Some(TimeDelta::from_secs(3)),
                max_throttling_duration: None,
                initial_budget: TimeDelta::from_secs(1),
            },
            Self::Aggressive => BudgetPoolConfig {
                name,
                recovery_rate: 0.01,
                max_budget_level: Some(TimeDelta::from_millis(500)),
                max_throttling_duration: Some(TimeDelta::from_secs(60)),
                initial_budget: TimeDelta::ZERO,
            },
            Self::Permissive => BudgetPoolConfig {
                name,
                recovery_rate: 0.5,
                max_budget_level: Some(TimeDelta::from_secs(10)),
                max_throttling_duration: Some(TimeDelta::from_secs(5)),
                initial_budget: TimeDelta::from_secs(1),
            },
        }
    }

    /// Short description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Background => "Background tabs: 1% CPU with a 3s burst ceiling",
            Self::Aggressive => "Tight 1% CPU budget, debt blocks for at most 60s",
            Self::Permissive => "50% CPU, debt blocks for at most 5s",
        }
    }

    /// Every profile.
    #[must_use]
    pub const fn all_profiles() -> &'static [Self] {
        &[Self::Background, Self::Aggressive, Self::Permissive]
    }
}
