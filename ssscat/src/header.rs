//! Construction of raw tar header bytes.
//!
//! The engine never feeds object data through a `tar::Builder`; payloads stay in object storage
//! and are stitched in by server-side range copies.  What the engine does need is the exact bytes
//! that sit *between* payloads: the 512-byte ustar header block for each entry, the zero padding
//! that rounds the previous payload up to a block boundary, and the zero trailer that ends the
//! archive.  This module produces those bytes using the `tar` crate's header types, so the layout
//! stays bit-compatible with what `tar::Builder` would have written.
use crate::objstore::SourceObject;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use snafu::prelude::*;

/// The tar block size.  Every header occupies one block and every payload is padded to a
/// multiple of it.
pub(crate) const BLOCK_SIZE: u64 = 512;

/// The widest name that fits in a ustar header without a long-name extension, when the
/// prefix-splitting trick doesn't apply.
const USTAR_NAME_LEN: usize = 100;

/// The number of zero bytes needed to round `len` up to the next block boundary.
pub(crate) fn block_padding(len: u64) -> u64 {
    (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE
}

/// Build the header bytes that must immediately precede the payload of `entry` in the archive.
///
/// The returned buffer contains, in order:
///
/// 1. zero padding rounding the predecessor's payload up to a block boundary (absent for the
///    first entry),
/// 2. a GNU long-name pseudo entry if the key doesn't fit the ustar name and prefix fields,
/// 3. the ustar header block for `entry` itself.
///
/// Keeping the predecessor's padding inside the *next* entry's header bytes means payload pieces
/// are always exactly the source object's bytes, so they can be stitched in as untouched range
/// copies.
pub(crate) fn build_header(
    entry: &SourceObject,
    predecessor: Option<&SourceObject>,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();

    if let Some(prev) = predecessor {
        buf.resize(block_padding(prev.size) as usize, 0);
    }

    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(
        entry
            .last_modified
            .map(|timestamp| timestamp.timestamp().max(0) as u64)
            .unwrap_or(0),
    );
    header.set_size(entry.size);

    if header.set_path(&entry.key).is_err() {
        // The key doesn't fit even with the ustar prefix split, so emit a GNU long-name pseudo
        // entry carrying the full key, followed by the real header with a truncated name for the
        // benefit of readers that predate the extension.
        append_long_name(&mut buf, &entry.key)?;

        let name_bytes = entry.key.as_bytes();
        let truncate_at = floor_char_boundary(&entry.key, USTAR_NAME_LEN);
        let ustar = header
            .as_ustar_mut()
            .expect("BUG: header was created as ustar");
        // The failed set_path may have left partial bytes in either field
        ustar.name = [0; 100];
        ustar.prefix = [0; 155];
        ustar.name[..truncate_at].copy_from_slice(&name_bytes[..truncate_at]);
    }

    header.set_cksum();
    buf.extend_from_slice(header.as_bytes());

    Ok(buf.freeze())
}

/// Append a GNU `L` (long name) pseudo entry: one header block announcing the name length,
/// followed by the NUL-terminated name padded to a block boundary.
fn append_long_name(buf: &mut BytesMut, key: &str) -> Result<()> {
    let name_bytes = key.as_bytes();
    // GNU tar counts the terminating NUL in the pseudo entry's size
    let data_len = name_bytes.len() as u64 + 1;

    let mut long = tar::Header::new_gnu();
    long.set_entry_type(tar::EntryType::GNULongName);
    long.set_mode(0o644);
    long.set_uid(0);
    long.set_gid(0);
    long.set_mtime(0);
    long.set_size(data_len);
    long.set_path("././@LongLink")
        .with_context(|_| crate::error::TarHeaderSnafu {
            key: key.to_string(),
        })?;
    long.set_cksum();

    buf.extend_from_slice(long.as_bytes());
    buf.extend_from_slice(name_bytes);
    buf.put_u8(0);
    buf.resize(buf.len() + block_padding(data_len) as usize, 0);

    Ok(())
}

/// Largest index `<= max` that falls on a UTF-8 character boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }

    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

/// Build the literal trailer that ends the archive: zero padding rounding the archive up to a
/// block boundary, then the two zero blocks every tar reader expects.
///
/// `archive_len` is the total length of the archive before the trailer, leading pad excluded.
pub(crate) fn trailer(archive_len: u64) -> Bytes {
    let len = block_padding(archive_len) + 2 * BLOCK_SIZE;

    Bytes::from(vec![0u8; len as usize])
}
