//! Object storage clients.
//!
//! The [`backend::ObjectStorage`] trait abstracts over the S3-compatible
//! API the reconcilers talk to.  [`s3::S3Storage`] forwards to a real
//! endpoint; [`memory::MemoryStorage`] keeps everything in process and
//! doubles as the test fake.

pub mod backend;
pub mod memory;
pub mod s3;
