// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Splitting of length-prefixed MPEG-5 EVC elementary streams into access
//! units, along with the parameter set and slice header parsing needed to
//! find their boundaries.
//!
//! The entry point is [`codec::evc::stream::EvcStreamParser`], which accepts
//! the stream in chunks of any size.

pub mod bitstream_utils;
pub mod codec;

use std::fmt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
