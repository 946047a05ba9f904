// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    env,
    io::{self, BufWriter, Write},
    path::PathBuf,
    process::ExitCode,
};

use btrfs_ondisk::{self as ondisk, ChecksumOutcome, Decoded, Header, Key};
use btrfs_volume::{Filesystem, Options, SysfsDiscovery, TreeRoot, Visitor};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;

/// One JSON line per decoded item
#[derive(Serialize)]
struct Record<'a> {
    tree: u64,
    key: String,
    #[serde(flatten)]
    result: Outcome<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Outcome<'a> {
    Decoded { item: &'a ondisk::Item, leftover: usize },
    Failed { error: String },
}

/// Prints every item it visits to `out`
struct Printer<W: Write> {
    out: W,
    tree: u64,
    failure: Option<io::Error>,
}

impl<W: Write> Printer<W> {
    fn emit(&mut self, value: &impl Serialize) {
        if self.failure.is_some() {
            return;
        }
        let result = serde_json::to_writer(&mut self.out, value)
            .map_err(io::Error::from)
            .and_then(|_| writeln!(self.out));
        if let Err(e) = result {
            self.failure = Some(e);
        }
    }
}

impl<W: Write> Visitor for Printer<W> {
    fn tree(&mut self, root: &TreeRoot) {
        self.tree = root.id();
        info!("Walking tree {} at {:#x}", root.key, root.bytenr);
    }

    fn node(&mut self, addr: u64, _header: &Header, checksum: &ChecksumOutcome) {
        if let ChecksumOutcome::Unsupported(csum_type) = checksum {
            warn!("Node {addr:#x}: {csum_type} checksums cannot be verified");
        }
    }

    fn item(&mut self, key: &Key, _payload: &[u8], decoded: &Result<Decoded, ondisk::Error>) {
        let result = match decoded {
            Ok(decoded) => Outcome::Decoded {
                item: &decoded.item,
                leftover: decoded.leftover,
            },
            Err(e) => Outcome::Failed { error: e.to_string() },
        };
        let record = Record {
            tree: self.tree,
            key: key.to_string(),
            result,
        };
        self.emit(&record);
    }
}

fn run(paths: &[PathBuf]) -> Result<bool, Box<dyn std::error::Error>> {
    let fs = Filesystem::open(paths, &SysfsDiscovery::new(), Options::default())?;
    let sb = fs.superblock();

    let mut printer = Printer {
        out: BufWriter::new(io::stdout().lock()),
        tree: 0,
        failure: None,
    };
    printer.emit(&json!({
        "fsid": sb.fsid(),
        "metadata_uuid": sb.metadata_uuid(),
        "label": sb.label()?,
        "generation": sb.generation(),
        "num_devices": sb.num_devices(),
        "nodesize": sb.nodesize(),
        "csum_type": sb.csum_type().to_string(),
        "incompat": sb.incompat(),
        "compat_ro": sb.compat_ro(),
        "root": sb.root(),
        "chunk_root": sb.chunk_root(),
        "log_root": sb.log_root(),
        "dev_item": sb.dev_item(),
    }));

    let stats = fs.walk_all(&mut printer);
    printer.out.flush()?;
    if let Some(e) = printer.failure {
        return Err(e.into());
    }

    info!(
        "{} nodes, {} items, {} decode errors, {} checksum mismatches, {} trees skipped",
        stats.nodes, stats.items, stats.decode_errors, stats.checksum_mismatches, stats.failed_trees
    );
    Ok(stats.decode_errors == 0 && stats.failed_trees == 0)
}

fn main() -> ExitCode {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let paths = env::args_os().skip(1).map(PathBuf::from).collect::<Vec<_>>();
    if paths.is_empty() {
        eprintln!("usage: btrfs-dump <device>...");
        return ExitCode::FAILURE;
    }

    match run(&paths) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
