//! `mamba-storage`
//!
//! Append-only hierarchical data files and the writer that stores each run
//! in one of them.
//!
//! - [`DataFile`]: sections, datasets with a growable first axis, one writer
//!   per path
//! - [`NativeFile`]: JSON tree, always built
//! - `Hdf5File`: HDF5 backend behind the `storage_hdf5` feature
//! - [`FileWriter`]: data router sink writing `scan/…` per run

pub mod data_file;
pub mod file_writer;
#[cfg(feature = "storage_hdf5")]
pub mod hdf5_file;
pub mod native;

pub use data_file::{DType, DataFile, Dataset, Elements, WriterLock};
pub use file_writer::{
    create_file, expand_name, new_session_id, FileFormat, FileWriter, FileWriterConfig,
};
pub use native::{NativeFile, NativeTree};

#[cfg(feature = "storage_hdf5")]
pub use hdf5_file::Hdf5File;
