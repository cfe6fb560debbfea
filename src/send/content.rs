//! File content and extended attributes.

use crate::error::{Result, SendError};
use crate::send::traversal::{StreamSink, Traversal};
use crate::tree::items::{
    inline_data, parse_xattrs, FileExtentHeader, FileKind, RegularExtent, COMPRESSION_LZO,
    COMPRESSION_NONE, COMPRESSION_ZLIB, COMPRESSION_ZSTD, ENCODING_NONE, ENCRYPTION_NONE,
    EXTENT_TYPE_INLINE, EXTENT_TYPE_PREALLOC, EXTENT_TYPE_REGULAR,
};
use crate::tree::{Item, SubvolumeTree, TreeReader};
use tracing::{debug, warn};

/// Reject extents this sender cannot interpret at all.
fn check_extent_header(item: &Item, header: &FileExtentHeader) -> Result<()> {
    let unsupported = |what, value| SendError::Unsupported {
        key: item.key,
        what,
        value,
    };
    if header.extent_type != EXTENT_TYPE_INLINE && header.extent_type != EXTENT_TYPE_REGULAR {
        return Err(unsupported("extent type", u64::from(header.extent_type)));
    }
    if header.encryption != ENCRYPTION_NONE {
        return Err(unsupported("encryption type", u64::from(header.encryption)));
    }
    if header.other_encoding != ENCODING_NONE {
        return Err(unsupported("encoding type", u64::from(header.other_encoding)));
    }
    match header.compression {
        COMPRESSION_NONE | COMPRESSION_ZLIB | COMPRESSION_LZO | COMPRESSION_ZSTD => Ok(()),
        other => Err(unsupported("compression type", u64::from(other))),
    }
}

impl<'t, T: SubvolumeTree, S: StreamSink> Traversal<'t, T, S> {
    /// Emit writes for one extent item. Takes the reader by value because
    /// long extents may suspend, which replaces it.
    pub(super) fn handle_extent(
        &mut self,
        mut reader: T::Reader<'t>,
        item: &Item,
    ) -> Result<T::Reader<'t>> {
        let acc = self.current_for(&item.key)?;
        // Symlink targets were consumed at creation.
        if acc.kind == FileKind::Symlink {
            return Ok(reader);
        }
        let (path, size) = (acc.path.clone(), acc.size);

        let header = FileExtentHeader::parse(item)?;
        if header.extent_type == EXTENT_TYPE_PREALLOC {
            return Ok(reader);
        }
        check_extent_header(item, &header)?;

        if header.extent_type == EXTENT_TYPE_INLINE {
            if header.compression != COMPRESSION_NONE {
                self.skip_compressed(item, header.compression);
                return Ok(reader);
            }
            let data = inline_data(item, &header)?;
            self.encoder.write(&path, item.key.offset, &data)?;
            self.stats.writes += 1;
            self.stats.data_bytes += data.len() as u64;
            return Ok(reader);
        }

        let extent = RegularExtent::parse(item)?;
        if extent.is_hole() {
            return Ok(reader);
        }
        if header.compression != COMPRESSION_NONE {
            self.skip_compressed(item, header.compression);
            return Ok(reader);
        }

        debug!(key = %item.key, bytenr = extent.disk_bytenr, len = extent.num_bytes, "extent");
        let base = extent
            .disk_bytenr
            .checked_add(extent.offset)
            .filter(|base| base.checked_add(extent.num_bytes).is_some())
            .filter(|_| item.key.offset.checked_add(extent.num_bytes).is_some())
            .ok_or_else(|| SendError::truncated(item.key, "extent range overflows"))?;
        let max_write = self.max_write as u64;
        let mut off = 0u64;
        while off < extent.num_bytes {
            if self.over_high_water() {
                reader = self.suspend(reader, item)?;
            }

            let length = (extent.num_bytes - off).min(max_write);
            let remaining = size.saturating_sub(item.key.offset.saturating_add(off));
            let clipped = length.min(remaining);
            if clipped == 0 {
                break;
            }

            let data = reader.read_extent(base + off, clipped as usize)?;
            self.encoder.write(&path, item.key.offset + off, &data)?;
            self.stats.writes += 1;
            self.stats.data_bytes += clipped;
            off += length;
        }
        Ok(reader)
    }

    fn skip_compressed(&mut self, item: &Item, compression: u8) {
        warn!(key = %item.key, compression, "compressed extent not sent");
        self.stats.compressed_skipped += 1;
    }

    /// One set_xattr per stored name/value pair, in stored order.
    pub(super) fn handle_xattr(&mut self, item: &Item) -> Result<()> {
        let path = self.current_for(&item.key)?.path.clone();
        for entry in parse_xattrs(item)? {
            self.encoder.set_xattr(&path, &entry.name, &entry.value)?;
        }
        Ok(())
    }
}
