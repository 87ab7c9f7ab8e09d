//! Disk backend classification.
//!
//! Every disk handed to the guest is classified once, when the VM is
//! assembled. The first matching rule wins:
//!
//! 1. `stat` fails: [`Disktype::Unknown`]
//! 2. character or block special file: [`Disktype::BlockDevice`]
//! 3. explicit `Qcow2Image` or `RawFile` hint: the hint
//! 4. leading bytes are the qcow2 magic: [`Disktype::Qcow2Image`]
//! 5. anything else: [`Disktype::RawFile`]
//!
//! A file that stats but cannot be opened or read is `Unknown` as well.
//! Callers must refuse to attach an `Unknown` disk.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use runq_protocol::Disktype;
use tracing::debug;

/// First four bytes of every qcow2 image.
pub const QCOW2_MAGIC: [u8; 4] = *b"QFI\xfb";

/// Classify the disk at `path`, honoring an explicit format hint.
pub fn classify(path: &Path, hint: Option<Disktype>) -> Disktype {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "disk stat failed");
            return Disktype::Unknown;
        }
    };

    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        return Disktype::BlockDevice;
    }

    // Only image formats can describe a regular file.
    let image_hint = hint.filter(|h| matches!(h, Disktype::Qcow2Image | Disktype::RawFile));
    if let Some(hint) = image_hint {
        return hint;
    }

    match read_magic(path) {
        Ok(magic) if magic == QCOW2_MAGIC => Disktype::Qcow2Image,
        Ok(_) => Disktype::RawFile,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "disk header unreadable");
            Disktype::Unknown
        }
    }
}

/// Up to the first four bytes of the file; shorter files yield fewer bytes.
fn read_magic(path: &Path) -> io::Result<Vec<u8>> {
    let mut magic = Vec::with_capacity(QCOW2_MAGIC.len());
    File::open(path)?
        .take(QCOW2_MAGIC.len() as u64)
        .read_to_end(&mut magic)?;
    Ok(magic)
}
