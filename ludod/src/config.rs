//! `LUDO_*` environment settings for the sync services.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::sync::conflict::{ConflictResolutionConfig, GameField};
use crate::sync::scheduler::SchedulerConfig;

/// A source of configuration variables. The daemon reads the process
/// environment; tests pass a map.
pub struct Env<F> {
    lookup: F,
}

impl Env<fn(&str) -> Option<String>> {
    pub fn process() -> Self {
        fn read(name: &str) -> Option<String> {
            std::env::var(name).ok()
        }
        Env { lookup: read }
    }
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Trimmed value; blank counts as unset.
    pub fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Positive integer or `default`; unparsable and zero values fall back.
    pub fn u64_or(&self, name: &str, default: u64) -> u64 {
        self.string(name)
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(default)
    }

    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.string(name)
            .map(|value| {
                matches!(
                    value.to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(default)
    }

    pub fn parse_or<T>(&self, name: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.string(name) {
            Some(value) => value
                .parse()
                .map_err(|err| anyhow::anyhow!("{err}"))
                .with_context(|| format!("invalid value for {name}")),
            None => Ok(default),
        }
    }

    /// Comma separated values, blanks dropped.
    pub fn list(&self, name: &str) -> Vec<String> {
        self.string(name)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn secs_or(&self, name: &str, default: u64) -> Duration {
        Duration::from_secs(self.u64_or(name, default))
    }

    pub fn scheduler_config(&self) -> anyhow::Result<SchedulerConfig> {
        let defaults = SchedulerConfig::default();
        let config = SchedulerConfig {
            auto_sync: self.bool_or("LUDO_AUTO_SYNC", defaults.auto_sync),
            incremental_interval: self.secs_or(
                "LUDO_INCREMENTAL_INTERVAL_SECS",
                defaults.incremental_interval.as_secs(),
            ),
            full_interval: self
                .secs_or("LUDO_FULL_INTERVAL_SECS", defaults.full_interval.as_secs()),
            max_concurrent_syncs: self.u64_or(
                "LUDO_MAX_CONCURRENT_AUTO_SYNCS",
                defaults.max_concurrent_syncs as u64,
            ) as usize,
            quiet_hours_start: self
                .parse_or("LUDO_QUIET_HOURS_START", defaults.quiet_hours_start)?,
            quiet_hours_end: self.parse_or("LUDO_QUIET_HOURS_END", defaults.quiet_hours_end)?,
            activity_filter: self.bool_or("LUDO_ACTIVITY_FILTER", defaults.activity_filter),
            activity_threshold_days: self.u64_or(
                "LUDO_ACTIVITY_THRESHOLD_DAYS",
                u64::from(defaults.activity_threshold_days),
            ) as u32,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn conflict_config(&self) -> anyhow::Result<ConflictResolutionConfig> {
        let defaults = ConflictResolutionConfig::default();
        let protected_fields = match self.string("LUDO_CONFLICT_PROTECTED_FIELDS") {
            Some(value) if value.eq_ignore_ascii_case("none") => Vec::new(),
            Some(_) => self
                .list("LUDO_CONFLICT_PROTECTED_FIELDS")
                .iter()
                .map(|name| name.parse::<GameField>())
                .collect::<Result<Vec<_>, _>>()
                .context("invalid value for LUDO_CONFLICT_PROTECTED_FIELDS")?,
            None => defaults.protected_fields.clone(),
        };
        Ok(ConflictResolutionConfig {
            default_strategy: self
                .parse_or("LUDO_CONFLICT_DEFAULT_STRATEGY", defaults.default_strategy)?,
            auto_resolve: self.bool_or("LUDO_CONFLICT_AUTO_RESOLVE", defaults.auto_resolve),
            backup_before_resolve: self
                .bool_or("LUDO_CONFLICT_BACKUP", defaults.backup_before_resolve),
            max_conflict_age_days: self.u64_or(
                "LUDO_CONFLICT_MAX_AGE_DAYS",
                u64::from(defaults.max_conflict_age_days),
            ) as u32,
            protected_fields,
            ..defaults
        })
    }
}

pub fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
