// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MPEG-5 Essential Video Coding (ISO/IEC 23094-1) elementary stream support.
//!
//! EVC streams are carried as a sequence of NAL units, each preceded by a
//! 4-byte big-endian length. [`stream::EvcStreamParser`] accepts such a stream
//! in chunks of any size and returns complete access units.

pub mod evcc;
pub mod frame_merge;
pub mod nalu;
pub mod nalu_writer;
pub mod parser;
pub mod poc;
pub mod stream;
pub mod synthesizer;

use thiserror::Error;

use crate::bitstream_utils::ReadBitsError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bitstream violates the EVC syntax or references missing state.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// The stream is well formed but uses a configuration that downstream
    /// engines cannot consume.
    #[error("unsupported stream: {0}")]
    Unsupported(String),
}

impl From<ReadBitsError> for Error {
    fn from(err: ReadBitsError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
