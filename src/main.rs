// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::{Path, PathBuf};
use std::process;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{debug, info};
use qcow::{CopyOptions, CreateOptions, DigestAlgorithm, Disk, Image};
use qcow_img::{cli_print_error_chain, exit_code};
use thiserror::Error;

#[derive(Debug, Error)]
enum Error {
    #[error("Image check failed")]
    Check(#[source] qcow::Error),
    #[error("{} has {leaked} leaked clusters and {corruptions} corruptions", .path.display())]
    CheckFoundErrors {
        path: PathBuf,
        leaked: u64,
        corruptions: u64,
    },
    #[error("Failed to copy {} to {}", .0.display(), .1.display())]
    Copy(PathBuf, PathBuf, #[source] qcow::Error),
    #[error("Failed to create {}", .0.display())]
    Create(PathBuf, #[source] qcow::Error),
    #[error("Failed to hash {}", .0.display())]
    Hash(PathBuf, #[source] qcow::Error),
    #[error("Invalid arguments")]
    InvalidArguments(#[source] qcow::Error),
    #[error("Failed to open {}", .0.display())]
    Open(PathBuf, #[source] qcow::Error),
    #[error("Failed to serialize image info")]
    SerializeInfo(#[source] serde_json::Error),
    #[error("Failed to sparsify {} to {}", .0.display(), .1.display())]
    Sparsify(PathBuf, PathBuf, #[source] qcow::Error),
}

type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn exit_code(&self) -> i32 {
        match self {
            Error::Check(e)
            | Error::Copy(_, _, e)
            | Error::Create(_, e)
            | Error::Hash(_, e)
            | Error::InvalidArguments(e)
            | Error::Open(_, e)
            | Error::Sparsify(_, _, e) => exit_code(e.class()),
            Error::CheckFoundErrors { .. } => 2,
            Error::SerializeInfo(_) => 1,
        }
    }
}

fn create_app() -> Command {
    Command::new("qcow-img")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Create, inspect, checksum, copy and sparsify qcow2 and raw disk images.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Log more, -v for debug and -vv for trace messages"),
        )
        .subcommand(
            Command::new("create")
                .about("Create a qcow2 image")
                .arg(Arg::new("file").required(true).help("Image to create"))
                .arg(
                    Arg::new("size")
                        .help("Virtual size in bytes, K/M/G/T suffixes allowed. Defaults to the backing file's size"),
                )
                .arg(
                    Arg::new("backing")
                        .short('b')
                        .long("backing")
                        .num_args(1)
                        .help("Backing file of the new image"),
                )
                .arg(
                    Arg::new("backing-format")
                        .short('F')
                        .long("backing-format")
                        .num_args(1)
                        .requires("backing")
                        .help("Format of the backing file, detected when not given"),
                )
                .arg(
                    Arg::new("options")
                        .short('o')
                        .long("options")
                        .num_args(1)
                        .help(format!("Image options \"{}\"", CreateOptions::SYNTAX)),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("Describe an image")
                .arg(Arg::new("file").required(true))
                .arg(
                    Arg::new("output")
                        .long("output")
                        .num_args(1)
                        .value_parser(["human", "json"])
                        .default_value("human")
                        .help("Output format"),
                ),
        )
        .subcommand(
            Command::new("hash")
                .about("Print the digest of the logical content of an image")
                .arg(Arg::new("file").required(true))
                .arg(
                    Arg::new("algorithm")
                        .long("algorithm")
                        .num_args(1)
                        .value_parser(["sha1", "sha256"])
                        .default_value("sha1"),
                ),
        )
        .subcommand(
            Command::new("copy")
                .about("Copy an image to a new qcow2 image")
                .arg(Arg::new("source").required(true))
                .arg(Arg::new("dest").required(true))
                .arg(
                    Arg::new("options")
                        .short('o')
                        .long("options")
                        .num_args(1)
                        .help(format!("Copy options \"{}\"", CopyOptions::SYNTAX)),
                ),
        )
        .subcommand(
            Command::new("sparsify")
                .about("Write the content of an image to a new qcow2 image without backing file, skipping zeros")
                .arg(Arg::new("source").required(true))
                .arg(Arg::new("dest").required(true)),
        )
        .subcommand(
            Command::new("check")
                .about("Check the refcounts of a qcow2 image")
                .arg(Arg::new("file").required(true)),
        )
}

fn path_arg(matches: &ArgMatches, name: &str) -> PathBuf {
    // Required arguments are always present.
    PathBuf::from(matches.get_one::<String>(name).unwrap())
}

fn open_disk(path: &Path) -> Result<Disk> {
    Disk::open(path).map_err(|e| Error::Open(path.to_path_buf(), e))
}

fn create(matches: &ArgMatches) -> Result<()> {
    let path = path_arg(matches, "file");
    let mut options = Vec::new();
    if let Some(size) = matches.get_one::<String>("size") {
        options.push(format!("size={size}"));
    }
    if let Some(backing) = matches.get_one::<String>("backing") {
        options.push(format!("backing_file={backing}"));
    }
    if let Some(format) = matches.get_one::<String>("backing-format") {
        options.push(format!("backing_fmt={format}"));
    }
    if let Some(extra) = matches.get_one::<String>("options") {
        options.push(extra.clone());
    }
    let options: CreateOptions = options
        .join(",")
        .parse()
        .map_err(Error::InvalidArguments)?;

    let image = Image::create_with(&path, &options).map_err(|e| Error::Create(path.clone(), e))?;
    info!(
        "Created {} with virtual size {}",
        path.display(),
        image.virtual_size()
    );
    image.close().map_err(|e| Error::Create(path, e))
}

fn info(matches: &ArgMatches) -> Result<()> {
    let path = path_arg(matches, "file");
    let info = open_disk(&path)?
        .info()
        .map_err(|e| Error::Open(path.clone(), e))?;
    match matches.get_one::<String>("output").map(String::as_str) {
        Some("json") => println!("{}", info.to_json().map_err(Error::SerializeInfo)?),
        _ => println!("{info}"),
    }
    Ok(())
}

fn hash(matches: &ArgMatches) -> Result<()> {
    let path = path_arg(matches, "file");
    let algorithm: DigestAlgorithm = matches
        .get_one::<String>("algorithm")
        .map_or(Ok(DigestAlgorithm::default()), |a| a.parse())
        .map_err(Error::InvalidArguments)?;
    let disk = open_disk(&path)?;
    let digest = qcow::hash(&disk, algorithm).map_err(|e| Error::Hash(path, e))?;
    println!("{digest}");
    Ok(())
}

fn copy(matches: &ArgMatches) -> Result<()> {
    let source = path_arg(matches, "source");
    let dest = path_arg(matches, "dest");
    let options: CopyOptions = matches
        .get_one::<String>("options")
        .map_or(Ok(CopyOptions::default()), |o| o.parse())
        .map_err(Error::InvalidArguments)?;
    let disk = open_disk(&source)?;
    qcow::copy(&disk, &dest, &options)
        .and_then(Image::close)
        .map_err(|e| Error::Copy(source, dest, e))
}

fn sparsify(matches: &ArgMatches) -> Result<()> {
    let source = path_arg(matches, "source");
    let dest = path_arg(matches, "dest");
    let disk = open_disk(&source)?;
    qcow::flatten(&disk, &dest)
        .and_then(Image::close)
        .map_err(|e| Error::Sparsify(source, dest, e))
}

fn check(matches: &ArgMatches) -> Result<()> {
    let path = path_arg(matches, "file");
    let image = Image::open_read_only(&path).map_err(|e| Error::Open(path.clone(), e))?;
    let report = image.check().map_err(Error::Check)?;
    let guest_clusters = image.virtual_size().div_ceil(image.cluster_size());
    println!(
        "{}/{guest_clusters} = {:.2}% allocated clusters",
        report.allocated_clusters,
        report.allocated_clusters as f64 * 100.0 / guest_clusters.max(1) as f64
    );
    if report.is_clean() {
        println!("No errors were found on the image.");
        return Ok(());
    }
    Err(Error::CheckFoundErrors {
        path,
        leaked: report.leaked_clusters,
        corruptions: report.corruptions,
    })
}

fn run(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("create", sub)) => create(sub),
        Some(("info", sub)) => info(sub),
        Some(("hash", sub)) => hash(sub),
        Some(("copy", sub)) => copy(sub),
        Some(("sparsify", sub)) => sparsify(sub),
        Some(("check", sub)) => check(sub),
        // subcommand_required makes clap reject anything else.
        _ => unreachable!(),
    }
}

fn main() {
    let matches = create_app().get_matches();

    let level = match matches.get_count("verbose") {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    debug!("qcow-img {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&matches) {
        cli_print_error_chain(&e, "qcow-img");
        process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn app_is_consistent() {
        create_app().debug_assert();
    }

    #[test]
    fn parses_create() {
        let matches = create_app()
            .try_get_matches_from([
                "qcow-img", "create", "-b", "base.raw", "-o", "cluster_size=4K", "child.qcow2",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "create");
        assert_eq!(path_arg(sub, "file"), PathBuf::from("child.qcow2"));
        assert_eq!(sub.get_one::<String>("backing").unwrap(), "base.raw");
        assert!(sub.get_one::<String>("size").is_none());
    }

    #[test]
    fn backing_format_requires_backing() {
        assert!(create_app()
            .try_get_matches_from(["qcow-img", "create", "-F", "raw", "disk.qcow2", "1M"])
            .is_err());
    }

    #[test]
    fn verbose_is_global() {
        let matches = create_app()
            .try_get_matches_from(["qcow-img", "hash", "-vv", "disk.raw"])
            .unwrap();
        assert_eq!(matches.get_count("verbose"), 2);
    }
}
