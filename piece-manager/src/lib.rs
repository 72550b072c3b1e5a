#![deny(clippy::all, clippy::perf, clippy::correctness)]

#[macro_use]
extern crate log;

pub use crate::builder::*;
pub use crate::config::*;
pub use crate::constants::*;
pub use crate::disk_backed_storage::*;
pub use crate::error::*;
pub use crate::helpers::calculate_checksum;
pub use crate::identity::*;
pub use crate::kv_store::*;
pub use crate::metadata::*;
pub use crate::sealer::{Sealer, SealerError, StageTask, UnsealTask, UnsealedStream};
pub use crate::store::*;
pub use crate::traits::*;
pub use crate::types::*;

pub(crate) mod builder;
pub(crate) mod config;
pub(crate) mod constants;
pub(crate) mod disk_backed_storage;
pub(crate) mod error;
pub(crate) mod helpers;
pub(crate) mod identity;
pub(crate) mod kv_store;
pub(crate) mod metadata;
pub(crate) mod metadata_manager;
pub(crate) mod scheduler;
pub(crate) mod sealer;
pub(crate) mod state;
pub(crate) mod store;
pub(crate) mod traits;
pub(crate) mod types;
