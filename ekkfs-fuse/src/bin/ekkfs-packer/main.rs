mod cli;

use std::fs::OpenOptions;

use clap::Parser;
use ekkfs_fuse::Result;
use typed_bytesize::ByteSizeIec;

use self::cli::Cli;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    println!("source={:?}\nout={:?}", cli.source, cli.out);

    let disk_size = ByteSizeIec::mib(cli.size_mib).0;
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.out)?;

    let mut fs = ekkfs_fuse::create_image(fd, disk_size, cli.inodes)?;
    for name in ekkfs_fuse::pack_dir(&mut fs, &cli.source)? {
        log::info!("file={name:?}");
    }

    let statfs = fs.statfs()?;
    println!(
        "{} of {} blocks free, {} of {} inodes used",
        statfs.free_blocks, statfs.total_blocks, statfs.used_inodes, statfs.total_inodes
    );
    ekkfs_fuse::finish(fs)?;

    Ok(())
}
