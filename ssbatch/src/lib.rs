#![doc = include_str!("../README.md")]

mod batcher;
mod config;
mod error;
mod gate;
mod objstore;
mod sink;
mod transfer;
mod writers;

pub use config::Config;
pub use error::{BatchTransferError, Result};
pub use gate::{JobGate, JobPermit};
pub use objstore::{Bucket, FetchedObject, ObjectDescriptor, S3ObjectStorage};
pub use sink::{ArchiveSink, ArchiveSummary, TarArchiveSink};
pub use transfer::*;
