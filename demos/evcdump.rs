// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! evcdump, a simple program splitting an EVC elementary stream into access
//! units. Capable of computing MD5 checksums of the access units and writing
//! them back to a file.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use argh::FromArgs;
use evc_parser::codec::evc::evcc::write_evcc;
use evc_parser::codec::evc::frame_merge::AccessUnit;
use evc_parser::codec::evc::stream::probe;
use evc_parser::codec::evc::stream::EvcStreamParser;
use evc_parser::codec::evc::stream::FeedStatus;

#[derive(Debug)]
enum Md5Computation {
    Stream,
    AccessUnit,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "au" => Ok(Md5Computation::AccessUnit),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, au"),
        }
    }
}

/// Splits an EVC elementary stream into access units
#[derive(Debug, FromArgs)]
struct Args {
    /// input file
    #[argh(positional)]
    input: PathBuf,

    /// output file to write the access units to
    #[argh(option)]
    output: Option<PathBuf>,

    /// file to write the evcC decoder configuration record to
    #[argh(option)]
    evcc: Option<PathBuf>,

    /// size of the chunks the input is fed in. Default: 4096
    #[argh(option, default = "4096")]
    chunk_size: usize,

    /// whether to display the MD5 of the access units, and at which granularity (stream or au)
    #[argh(option)]
    compute_md5: Option<Md5Computation>,
}

struct Dumper {
    output: Option<File>,
    compute_md5: Option<Md5Computation>,
    md5_context: md5::Context,
    count: usize,
}

impl Dumper {
    fn on_access_unit(&mut self, au: AccessUnit) -> anyhow::Result<()> {
        println!(
            "AU {}: {} bytes poc {:?} key_frame {} nal_types {:?}",
            self.count,
            au.data.len(),
            au.poc,
            au.key_frame,
            au.nal_types
        );
        self.count += 1;

        if let Some(output) = &mut self.output {
            output
                .write_all(&au.data)
                .context("failed to write to output file")?;
        }

        match self.compute_md5 {
            None => (),
            Some(Md5Computation::AccessUnit) => println!("{:x}", md5::compute(&au.data)),
            Some(Md5Computation::Stream) => self.md5_context.consume(&au.data),
        }

        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = {
        let mut buf = Vec::new();
        File::open(&args.input)
            .context("error opening input file")?
            .read_to_end(&mut buf)
            .context("error reading input file")?;
        buf
    };

    if probe(&input) == 0 {
        log::warn!("{} does not look like an EVC stream", args.input.display());
    }

    if let Some(path) = &args.evcc {
        let mut evcc = Vec::new();
        write_evcc(&mut evcc, &input, true).context("failed to build evcC record")?;
        File::create(path)
            .context("error creating evcC file")?
            .write_all(&evcc)
            .context("failed to write evcC record")?;
    }

    let mut dumper = Dumper {
        output: args
            .output
            .map(File::create)
            .transpose()
            .context("error creating output file")?,
        compute_md5: args.compute_md5,
        md5_context: md5::Context::new(),
        count: 0,
    };

    let mut parser = EvcStreamParser::default();
    for chunk in input.chunks(args.chunk_size.max(1)) {
        let mut status = parser.feed(chunk);
        // Errors drop the offending NAL unit, keep going with what is left.
        while let Err(e) = &status {
            log::error!("{}", e);
            status = parser.feed(&[]);
        }

        if let Ok(FeedStatus::AccessUnits(aus)) = status {
            for au in aus {
                dumper.on_access_unit(au)?;
            }
        }
    }

    for au in parser.flush() {
        dumper.on_access_unit(au)?;
    }

    if let Some(info) = parser.stream_info() {
        println!(
            "profile_idc {} level_idc {} {} chroma_format_idc {} bit depth {}/{}",
            info.profile_idc,
            info.level_idc,
            info.resolution,
            info.chroma_format_idc,
            info.bit_depth_luma,
            info.bit_depth_chroma
        );

        if let Err(e) = info.check_supported() {
            println!("not decodable: {}", e);
        }
    }

    if let Some(Md5Computation::Stream) = dumper.compute_md5 {
        println!("{:x}", dumper.md5_context.compute());
    }

    Ok(())
}
