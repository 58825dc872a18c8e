#![doc = include_str!("../README.md")]
#![warn(
    missing_docs,
    rustdoc::missing_crate_level_docs,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
#![allow(
    clippy::unreadable_literal,
    clippy::cognitive_complexity,
    clippy::match_like_matches_macro,
    clippy::derive_partial_eq_without_eq
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod options;

pub use ::bson;

mod binding;
mod client;
mod cmap;
mod concern;
mod context;
mod cursor;
pub mod error;
pub mod event;
mod executor;
mod handle;
mod hello;
mod namespace;
mod operation;
mod protocol;
pub mod results;
mod sdam;
mod selection_criteria;
mod serde_util;
mod session;
#[cfg(feature = "sync")]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub mod sync;
#[cfg(test)]
mod test;
mod trace;

pub use crate::{
    client::Client,
    cmap::{AsyncReadWrite, AsyncStream, ConnectionInfo, StreamConnector, TcpConnector},
    cursor::Cursor,
    namespace::Namespace,
    sdam::{ServerDescription, ServerType, TopologyType, TopologyVersion},
    session::{ClusterTime, CoreSession},
};
