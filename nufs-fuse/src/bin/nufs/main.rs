mod cli;

use std::path::Path;

use clap::Parser;
use cli::{Cli, Command};
use nufs::{Owner, Storage, IMAGE_SIZE};
use nufs_fuse::MountOptions;
use typed_bytesize::ByteSizeIec;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {
        Command::Mount {
            image,
            mountpoint,
            allow_other,
            auto_unmount,
            read_only,
        } => {
            let storage = open(&image)?;
            let options = MountOptions {
                read_only,
                allow_other,
                auto_unmount,
            };
            nufs_fuse::mount(storage, mountpoint, &options)?;
        }
        Command::Format { image } => {
            let storage = open(&image)?;
            let statfs = storage.statfs();
            println!(
                "{}: {} blocks free, {} inodes free",
                image.display(),
                statfs.free_blocks,
                statfs.free_inodes
            );
        }
        Command::Pack { image, source } => {
            let storage = open(&image)?;
            nufs_fuse::pack(&storage, &source)?;
        }
        Command::Ls { image, path } => {
            let storage = open(&image)?;
            for entry in storage.list(path.as_str())? {
                println!(
                    "{:>4} {:06o} {:>3} {:>8} {}",
                    entry.inode,
                    entry.stat.mode(),
                    entry.stat.links,
                    entry.stat.size,
                    entry.name
                );
            }
        }
    }

    Ok(())
}

/// Opens the image, reporting every inode as owned by the invoking user.
fn open(image: &Path) -> vfs::Result<Storage> {
    log::info!(
        "image={} ({})",
        image.display(),
        ByteSizeIec(IMAGE_SIZE as u64)
    );
    // SAFETY: getuid and getgid cannot fail and touch no memory
    let owner = unsafe {
        Owner {
            uid: libc::getuid(),
            gid: libc::getgid(),
        }
    };
    Ok(nufs_fuse::open_image(image)?.with_owner(owner))
}
