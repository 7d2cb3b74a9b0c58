//! Heap configuration, fixed when the heap is constructed.

use std::{fmt, str::FromStr};

use crate::{chunk::HEADER_UNIT_SIZE, error::ConfigError};

/// How the allocation engine picks a free chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Policy {
    /// First chunk large enough, scanning from the rover. Splits hand out the
    /// leading part of the chunk.
    #[default]
    FirstFit,
    /// Chunk with the smallest leftover over a full cycle. Splits hand out the
    /// trailing part of the chunk.
    BestFit,
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first-fit" | "first" | "ff" => Ok(Policy::FirstFit),
            "best-fit" | "best" | "bf" => Ok(Policy::BestFit),
            other => Err(format!("unknown placement policy `{other}`")),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::FirstFit => f.write_str("first-fit"),
            Policy::BestFit => f.write_str("best-fit"),
        }
    }
}

/// Construction-time settings of a [`crate::Heap`].
///
/// ```
/// use roverheap::{Config, Policy};
///
/// let config = Config::new()
///     .with_page_size(4096)
///     .with_policy(Policy::BestFit)
///     .with_coalescing(false);
///
/// assert_eq!(config.policy, Policy::BestFit);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bytes per growth unit. `None` uses the page size of the memory source.
    pub page_size: Option<usize>,
    /// Bytes per chunk header, the granularity of every chunk size.
    pub unit_size: usize,
    pub policy: Policy,
    /// Merge address-adjacent free chunks on free.
    pub coalescing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: None,
            unit_size: HEADER_UNIT_SIZE,
            policy: Policy::FirstFit,
            coalescing: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_unit_size(mut self, unit_size: usize) -> Self {
        self.unit_size = unit_size;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_coalescing(mut self, coalescing: bool) -> Self {
        self.coalescing = coalescing;
        self
    }

    /// Checks the settings against the effective `page_size`.
    pub fn validate(&self, page_size: usize) -> Result<(), ConfigError> {
        if !page_size.is_power_of_two() {
            return Err(ConfigError::InvalidPageSize(page_size));
        }

        if !self.unit_size.is_power_of_two() {
            return Err(ConfigError::InvalidUnitSize(self.unit_size));
        }

        if page_size % self.unit_size != 0 {
            return Err(ConfigError::UnitDoesNotDividePage {
                unit: self.unit_size,
                page: page_size,
            });
        }

        Ok(())
    }
}
