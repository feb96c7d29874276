//! # Archive and Transfer
//!
//! - [`archive`] compresses the export directory into one zip or tar file
//! - [`sftp`] delivers that file to the remote endpoint over an SSH session

pub mod archive;
pub mod sftp;

pub use archive::compress_directory;
pub use sftp::{
    PrivateKey, ProgressCallback, ProgressReader, RemoteTransport, SftpTransport, TransferProgress,
    TransferReport, TransferRequest,
};
