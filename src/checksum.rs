//! File digests used to identify uploaded packages.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use failure::Error;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{error::Kind, Result};

/// Size of the read buffer.
const BUFFER_SIZE: usize = 128 * 1024;

/// MD5, SHA-1 and SHA-256 digests of a file, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDigest {
    md5: String,
    sha1: String,
    sha256: String,
    size: u64,
}

impl FileDigest {
    /// Computes the digests of the file at the given path in a single streaming pass.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| checksum_error(path, &e))?;
        Self::from_reader(file).map_err(|e| checksum_error(path, &e))
    }

    /// Computes the digests of everything readable from the given reader.
    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut md5 = md5::Context::new();
        let mut sha1 = Sha1::new();
        let mut sha256 = Sha256::new();
        let mut buffer = vec![0_u8; BUFFER_SIZE];
        let mut size = 0_u64;

        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            md5.consume(&buffer[..read]);
            sha1.update(&buffer[..read]);
            sha256.update(&buffer[..read]);
            size += read as u64;
        }

        Ok(Self {
            md5: format!("{:x}", md5.compute()),
            sha1: hex::encode(sha1.finalize()),
            sha256: hex::encode(sha256.finalize()),
            size,
        })
    }

    /// Gets the MD5 digest.
    pub fn md5(&self) -> &str {
        &self.md5
    }

    /// Gets the SHA-1 digest.
    pub fn sha1(&self) -> &str {
        &self.sha1
    }

    /// Gets the SHA-256 digest.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Gets the number of bytes hashed.
    pub fn size(&self) -> u64 {
        self.size
    }
}

fn checksum_error(path: &Path, error: &io::Error) -> Error {
    Kind::Checksum {
        path: path.display().to_string(),
        message: error.to_string(),
    }
    .into()
}
