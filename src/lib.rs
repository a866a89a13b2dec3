//! Indexes a directory of photographs and answers two similarity
//! questions over its contents: which photos are exact or
//! near-duplicates of each other, and which photos are perceptually
//! close to a user-supplied query image.
//!
//! The pieces, leaves first:
//! - [`path_graph`]: a typed, serialisable path trie with per-node
//!   metadata (component A).
//! - [`file_tree`]: anchors a [`path_graph::PathGraph`] to a concrete
//!   filesystem root and exposes path-keyed `Element` handles
//!   (component B).
//! - [`image_loader`] and [`hash_primitives`]: decoding plus the
//!   cryptographic and perceptual hash functions (components C, D).
//! - [`photo`]: ties an `Element` to a lazily decoded image and its
//!   cached hashes, with durable error marking (component E).
//! - [`similarity`]: the two-index builder and search (components F,
//!   G).
//! - [`driver`]: cache load/build policy, the parallel ingest loop,
//!   and report assembly (component H).
//!
//! Plus the ambient stack: [`config`], [`counters`], [`progress`],
//! [`report`] and [`error`].

pub mod config;
pub mod counters;
pub mod driver;
pub mod error;
pub mod file_tree;
pub mod hash_primitives;
pub mod image_loader;
pub mod path_graph;
pub mod photo;
pub mod progress;
pub mod report;
pub mod similarity;
