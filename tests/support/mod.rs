#![allow(dead_code)]

pub mod harness;
pub mod http_utils;
pub mod net;
pub mod origin;

pub use harness::*;
pub use http_utils::*;
pub use net::*;
pub use origin::*;
