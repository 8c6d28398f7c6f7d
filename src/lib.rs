// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Common library functions for Ready-Set, a local application launcher

pub mod config;
mod error;
pub mod fork;
pub mod procs;
pub mod source;
pub mod status;

pub use error::{Error, ErrorKind};
