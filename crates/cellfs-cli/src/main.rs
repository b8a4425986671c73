#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cellfs::{CellFs, FsInfo};
use cellfs_block::FileBlockDevice;
use cellfs_types::BLOCK_SIZE;
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    #[serde(flatten)]
    info: FsInfo,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(path) = args.next() else {
                bail!("mkfs requires <image-path> <nr-blocks> <nr-inodes>");
            };
            let Some(nr_blocks) = args.next() else {
                bail!("mkfs requires <image-path> <nr-blocks> <nr-inodes>");
            };
            let Some(nr_inodes) = args.next() else {
                bail!("mkfs requires <image-path> <nr-blocks> <nr-inodes>");
            };
            let nr_blocks: u32 = nr_blocks
                .parse()
                .context("nr-blocks must be an unsigned integer")?;
            let nr_inodes: u32 = nr_inodes
                .parse()
                .context("nr-inodes must be an unsigned integer")?;
            mkfs(Path::new(&path), nr_blocks, nr_inodes)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        other => {
            print_usage();
            bail!("unknown command: {other}");
        }
    }
}

fn mkfs(path: &Path, nr_blocks: u32, nr_inodes: u32) -> Result<()> {
    let dev = FileBlockDevice::create(path, nr_blocks)
        .with_context(|| format!("creating image at {}", path.display()))?;
    CellFs::format(&dev, nr_inodes).context("formatting image")?;
    println!(
        "formatted {}: {nr_blocks} blocks x {BLOCK_SIZE} bytes, {nr_inodes} inodes",
        path.display()
    );
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let dev = FileBlockDevice::open(path)
        .with_context(|| format!("opening image at {}", path.display()))?;
    let fs = CellFs::mount(Arc::new(dev)).context("mounting image")?;
    let output = InspectOutput {
        block_size: BLOCK_SIZE,
        info: fs.info(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        let info = &output.info;
        println!("blocks:       {} x {} bytes", info.nr_blocks, output.block_size);
        println!("inodes:       {}", info.nr_inodes);
        println!(
            "metadata:     {} istore + {} ifree + {} bfree blocks",
            info.nr_istore_blocks, info.nr_ifree_blocks, info.nr_bfree_blocks
        );
        println!("free inodes:  {}", info.nr_free_inodes);
        println!("free blocks:  {}", info.nr_free_blocks);
    }
    Ok(())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  cellfs mkfs <image-path> <nr-blocks> <nr-inodes>");
    eprintln!("  cellfs inspect <image-path> [--json]");
}
