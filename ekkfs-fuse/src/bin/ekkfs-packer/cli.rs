use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(about = "Pack a directory into an SD card image with an EKKFS partition")]
pub struct Cli {
    /// Directory of files to pack
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output image
    #[arg(long, short)]
    pub out: PathBuf,

    /// Image size in MiB
    #[arg(long, default_value_t = ekkfs_fuse::DEFAULT_SIZE_MIB)]
    pub size_mib: u64,

    /// Number of inodes
    #[arg(long, default_value_t = ekkfs::DEFAULT_INODES)]
    pub inodes: u32,
}
