//! Types shared between the storage engine and the driver adapters sitting on
//! top of it: the error taxonomy, attribute records and directory listings.

mod dirent;
mod error;
mod stat;

pub use self::{
    dirent::DirEntry,
    error::{Error, Result},
    stat::{FileType, Permission, Stat, StatFs},
};
