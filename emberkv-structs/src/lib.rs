//! # EmberKV Structs
//!
//! In-memory data-structure primitives for the EmberKV server loop.
//!
//! This crate provides:
//! - [`IntSet`]: compact sorted set of `i64` values packed at adaptive
//!   16/32/64-bit width in a single little-endian buffer
//! - [`ByteString`]: binary-safe mutable string with explicit length/free
//!   accounting, amortized growth, and a restricted formatting/splitting
//!   mini-language
//! - [`Dict`]: chained hash table over two internal tables with incremental
//!   (amortized O(1)) rehash, pluggable key disciplines, safe/unsafe
//!   iteration, stateless cursor scan, and random sampling
//!
//! ## Design Principles
//!
//! 1. **Single-owner**: no internal synchronization; every structure is
//!    exclusively owned and driven by one logical owner
//! 2. **Bounded-latency mutation**: no operation does unbounded work; dict
//!    expansions migrate one bucket per foreground operation
//! 3. **Canonical little-endian layouts**: packed buffers read and write
//!    `to_le_bytes`/`from_le_bytes`, portable across host byte orders

pub mod byte_string;
pub mod dict;
pub mod hash;
pub mod intset;

pub use byte_string::{ByteString, FmtArg, SplitArgsError};
pub use dict::{BinaryKeys, CaseInsensitiveKeys, Dict, IntKeys, KeyDiscipline};
pub use intset::{Encoding, IntSet};
