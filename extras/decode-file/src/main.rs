// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decodes an Annex-B H.264 file into raw YU12 frames using the hardware decoder.
//!
//! The input is fed to the decoder in chunks, and the decoded frames are appended to the output
//! file as they come. Set `RUST_LOG` to control the verbosity of the decoder logs.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use tracing_subscriber::EnvFilter;
use v4l2_m2m_decoder::Decoder;
use v4l2_m2m_decoder::DecoderConfig;

const USAGE: &str = "usage: m2m-decode-file <input.h264> <output.yuv> [width height] [chunk-size]";

const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
/// 220 KiB.
const DEFAULT_CHUNK_SIZE: usize = 225280;

/// Exit code for invalid arguments, as in sysexits.h.
const EXIT_USAGE: u8 = 64;

#[derive(Debug, PartialEq, Eq)]
struct Args {
    input: PathBuf,
    output: PathBuf,
    width: u32,
    height: u32,
    chunk_size: usize,
}

impl Args {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let args = args.into_iter().collect::<Vec<_>>();

        let (size, chunk_size) = match args.len() {
            2 => (None, None),
            3 => (None, Some(&args[2])),
            4 => (Some((&args[2], &args[3])), None),
            5 => (Some((&args[2], &args[3])), Some(&args[4])),
            n => return Err(anyhow!("expected 2 to 5 arguments, got {}", n)),
        };

        let (width, height) = match size {
            Some((width, height)) => (
                width.parse().context("invalid width")?,
                height.parse().context("invalid height")?,
            ),
            None => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
        };
        let chunk_size = match chunk_size {
            Some(size) => size.parse().context("invalid chunk size")?,
            None => DEFAULT_CHUNK_SIZE,
        };
        if chunk_size == 0 {
            return Err(anyhow!("chunk size must not be zero"));
        }

        Ok(Self {
            input: PathBuf::from(&args[0]),
            output: PathBuf::from(&args[1]),
            width,
            height,
            chunk_size,
        })
    }
}

/// An error, and the code the program exits with because of it.
struct Failure {
    code: u8,
    error: anyhow::Error,
}

fn failed(code: u8) -> impl FnOnce(anyhow::Error) -> Failure {
    move |error| Failure { code, error }
}

/// Read the next chunk of at most `chunk_size` bytes into `chunk`.
///
/// Returns whether this chunk is the last one.
fn read_chunk<R: BufRead>(
    reader: &mut R,
    chunk: &mut Vec<u8>,
    chunk_size: usize,
) -> io::Result<bool> {
    chunk.clear();
    reader
        .by_ref()
        .take(chunk_size as u64)
        .read_to_end(chunk)?;

    Ok(chunk.len() < chunk_size || reader.fill_buf()?.is_empty())
}

fn run(args: &Args) -> Result<(), Failure> {
    let mut decoder = Decoder::new(DecoderConfig::new(args.width, args.height));
    decoder
        .initialize()
        .map_err(|e| anyhow!("failed to initialize decoder (error code {}): {}", e.code(), e))
        .map_err(failed(1))?;

    let input = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))
        .map_err(failed(2))?;
    let mut input = BufReader::new(input);

    let mut output = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.output)
        .with_context(|| format!("failed to open {}", args.output.display()))
        .map_err(failed(3))?;

    let mut chunk = Vec::with_capacity(args.chunk_size);
    loop {
        let is_last = read_chunk(&mut input, &mut chunk, args.chunk_size)
            .with_context(|| format!("failed to read {}", args.input.display()))
            .map_err(failed(2))?;

        let start = Instant::now();
        let frame = decoder
            .decode(&chunk, is_last)
            .map_err(|e| anyhow!("failed to decode (error code {}): {}", e.code(), e))
            .map_err(failed(4))?;
        let elapsed = start.elapsed();

        if !frame.output.is_empty() {
            println!(
                "decoded {} bytes of {}x{} frames in {} ms",
                frame.output.len(),
                frame.width,
                frame.height,
                elapsed.as_millis()
            );
            output
                .write_all(&frame.output)
                .with_context(|| format!("failed to write {}", args.output.display()))
                .map_err(failed(3))?;
        }

        if is_last {
            break;
        }
    }

    decoder.unload();

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{:#}\n{}", e, USAGE);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure { code, error }) => {
            log::error!("{:#}", error);
            ExitCode::from(code)
        }
    }
}
