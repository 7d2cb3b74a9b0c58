//! Error types of the heap.
//!
//! Only [`HeapError`] is expected to be handled by callers. [`Corruption`] is
//! what [`crate::Heap::check`] reports when the free list is broken; once that
//! happens the heap cannot be trusted anymore.

use thiserror::Error;

use crate::chunk::UnitAddr;

/// Errors returned by the public allocation API.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The memory source could not provide more pages.
    #[error("out of memory (requested {bytes} bytes, {pages} pages)")]
    OutOfMemory { bytes: usize, pages: usize },

    /// Payloads are only aligned to the unit size.
    #[error("alignment {align} exceeds the heap unit of {unit} bytes")]
    UnsupportedAlignment { align: usize, unit: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Rejected heap configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("page size must be a non-zero power of two, got {0}")]
    InvalidPageSize(usize),

    #[error("unit size must be a non-zero power of two, got {0}")]
    InvalidUnitSize(usize),

    #[error("unit size {unit} does not evenly divide page size {page}")]
    UnitDoesNotDividePage { unit: usize, page: usize },
}

/// Structural damage found while walking the free list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Corruption {
    #[error("dummy chunk is missing or has a non-zero size")]
    MissingDummy,

    #[error("chunk {at} has size zero but is not the dummy")]
    ZeroSizedChunk { at: UnitAddr },

    #[error("rover {at} is not a member of the free list")]
    MissingRover { at: UnitAddr },

    #[error("chunk {at} links to {next}, which is not a free chunk")]
    BrokenLink { at: UnitAddr, next: UnitAddr },

    #[error("free list does not cycle back to the dummy")]
    Unterminated,

    #[error("free list is out of order: wrap at {first} -> {first_next}, again at {second} -> {second_next}")]
    OutOfOrder {
        first: UnitAddr,
        first_next: UnitAddr,
        second: UnitAddr,
        second_next: UnitAddr,
    },

    #[error("chunk {at} ends at {end}, not before its successor {next}")]
    Overlap {
        at: UnitAddr,
        end: UnitAddr,
        next: UnitAddr,
    },
}
