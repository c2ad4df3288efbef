//! Test support for the `ssbatch` test suite.
//!
//! Nothing in here is part of the supported API; it exists so the integration tests can run the
//! whole transfer pipeline hermetically, without a live S3 endpoint.
pub mod logging;
pub mod mem;
pub mod tar;

pub type Result<T> = color_eyre::Result<T>;
