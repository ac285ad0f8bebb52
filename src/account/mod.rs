//! Account API: permissions and service accounts.
//!
//! [`api::AccountApi`] is the contract the reconcilers program against.
//! [`http::HttpAccountClient`] talks to the real service and
//! [`memory::MemoryAccountApi`] backs tests.

pub mod api;
pub mod http;
pub mod memory;
