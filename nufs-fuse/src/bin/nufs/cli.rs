use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "nufs disk image tool")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve an image through FUSE until it is unmounted
    Mount {
        /// Disk image, created when missing
        image: PathBuf,

        /// Directory to mount on
        mountpoint: PathBuf,

        /// Let other users access the mount
        #[arg(long)]
        allow_other: bool,

        /// Unmount automatically when the process exits
        #[arg(long)]
        auto_unmount: bool,

        /// Reject every modification
        #[arg(long)]
        read_only: bool,
    },

    /// Create an image or bring an existing file to image size
    Format {
        image: PathBuf,
    },

    /// Copy the regular files of a host directory into the image root
    Pack {
        image: PathBuf,

        /// Host directory to copy from
        #[arg(long, short)]
        source: PathBuf,
    },

    /// List a directory inside an image
    Ls {
        image: PathBuf,

        #[arg(default_value = "/")]
        path: String,
    },
}
