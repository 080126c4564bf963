// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a log-structured block cache.
//!
//! The cache sits between a slow backing device and a fast cache
//! device, presenting one virtual block device. Incoming writes are
//! staged into RAM buffers and appended to a circular log of
//! fixed-size segments on the cache device instead of being updated
//! in place; a hash index maps backing addresses to their cached
//! copies, and dirty copies are eventually written back to the
//! backing device by an external daemon.
//!
//! The main types are:
//!
//! - [`Writeboost`], the core: it speaks the host block-device
//!   contract ([`map`](Writeboost::map) / [`end_io`](Writeboost::end_io))
//!   and owns the flusher and read-cache worker threads.
//! - [`CacheDev`], a synchronous front-end that drives the contract
//!   against the two real devices.
//! - [`storage::block::Device`], the sector-addressed device trait
//!   both of them consume.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(deprecated_in_future)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(missing_abi)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

pub mod bio;
pub mod config;
mod dev;
mod flush;
mod index;
pub mod layout;
mod mempool;
mod rambuf;
mod readcache;
mod segment;
pub mod stats;

pub use bio::{Bio, BioKind, Completion, Disposition, Remap, ReqFlags, SubmitResult, Tag, TargetDev};
pub use config::{ConfigError, Options, Tunables};
pub use dev::{
    format_cache_device, CacheDev, ResumeRecord, ResumeState, Status, Writeboost,
    WritebackRecord,
};
pub use segment::{Dirtiness, Geometry};

use std::sync::{Mutex, MutexGuard};

/// Describes an error encountered while serving a request.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A device I/O error; the originating request fails but the
    /// log stays consistent.
    Io,

    /// A bounded scratch pool was exhausted; the request fails
    /// rather than blocking.
    OutOfMemory,

    /// The request was malformed: not sector-sized, or straddling
    /// a 4 KiB block boundary.
    InvalidRequest,
}

/// Acquires a mutex, treating a poisoned lock as the invariant
/// violation it is.
///
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("poisoned lock")
}
