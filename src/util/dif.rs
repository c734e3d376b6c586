//! Protection-information engine (T10 DIF / DIX).
//!
//! Generates and verifies the eight-byte protection tuple
//! `{guard: u16, app_tag: u16, ref_tag: u32}` carried by each logical
//! block, either interleaved with the data (DIF, extended LBA) or in a
//! separate metadata buffer (DIX). All tuple fields are stored big-endian.
//!
//! Two traversal regimes are implemented: a fast path used when every
//! scatter/gather region holds a whole number of blocks, and a slow path
//! that stages split blocks through temporary contiguous buffers when
//! blocks straddle region boundaries.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::util::crc16::crc16_t10dif;
use crate::util::sg::{self, SgCursor, SgEntry};

/// Size of the protection tuple in bytes.
pub const DIF_SIZE: usize = 8;

bitflags! {
    /// Which tuple fields are generated and checked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DifFlags: u32 {
        /// Generate/verify the CRC-16 guard field
        const GUARD_CHECK = 0x1;
        /// Generate/verify the application tag
        const APPTAG_CHECK = 0x2;
        /// Generate/verify the reference tag
        const REFTAG_CHECK = 0x4;
    }
}

/// Protection information type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifType {
    /// Protection information disabled
    Disable,
    /// Type 1: reference tag increments per block, seeded from the LBA
    Type1,
    /// Type 2: reference tag increments per block, application seeded
    Type2,
    /// Type 3: reference tag is opaque and never checked
    Type3,
}

/// Which field of a block an injected error lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectTarget {
    /// Flip a bit in the data portion
    Data,
    /// Flip a bit in the guard field
    Guard,
    /// Flip a bit in the application tag
    AppTag,
    /// Flip a bit in the reference tag
    RefTag,
}

/// Kind of the first mismatch found during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifErrorType {
    /// Guard (CRC) mismatch
    Guard,
    /// Application tag mismatch
    AppTag,
    /// Reference tag mismatch
    RefTag,
}

/// Verification failure: the failing field, the values involved, and the
/// index of the first failing block.
#[derive(Debug, Clone, Copy)]
pub struct DifError {
    /// Which check failed
    pub err_type: DifErrorType,
    /// The value carried on disk / on the wire
    pub expected: u32,
    /// The value recomputed or supplied by the caller
    pub actual: u32,
    /// Index of the first failing block
    pub err_offset: u32,
}

/// Per-I/O protection configuration.
#[derive(Debug, Clone)]
pub struct DifCtx {
    /// Bytes per block as laid out in the data buffers: the extended block
    /// (data + metadata) when interleaved, the bare data block for DIX.
    pub block_size: usize,
    /// Metadata bytes per block
    pub md_size: usize,
    /// Metadata interleaved with data (DIF) or separate (DIX)
    pub md_interleave: bool,
    /// Tuple placement inside the metadata: last eight bytes when set
    /// (the guard then covers everything up to the tuple), first eight
    /// bytes when clear (the guard covers only the data portion).
    pub md_start: bool,
    /// Protection type
    pub dif_type: DifType,
    /// Enabled checks
    pub dif_flags: DifFlags,
    /// Reference tag of the first block
    pub init_ref_tag: u32,
    /// Mask applied to the on-disk application tag before comparing
    pub apptag_mask: u16,
    /// Expected application tag
    pub app_tag: u16,
    guard_interval: usize,
}

impl DifCtx {
    /// Validate and build a protection context.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block_size: usize,
        md_size: usize,
        md_interleave: bool,
        md_start: bool,
        dif_type: DifType,
        dif_flags: DifFlags,
        init_ref_tag: u32,
        apptag_mask: u16,
        app_tag: u16,
    ) -> Result<Self> {
        match dif_type {
            DifType::Disable => {}
            DifType::Type1 | DifType::Type2 => {}
            DifType::Type3 => {
                if dif_flags.contains(DifFlags::REFTAG_CHECK) {
                    return Err(Error::invalid(
                        "reference tag must not be checked for DIF type 3",
                    ));
                }
            }
        }

        if dif_type != DifType::Disable {
            if md_size < DIF_SIZE {
                return Err(Error::invalid(format!(
                    "metadata size {} too small to hold protection information",
                    md_size
                )));
            }
            if md_interleave && block_size <= md_size {
                return Err(Error::invalid(format!(
                    "extended block size {} must exceed metadata size {}",
                    block_size, md_size
                )));
            }
        }

        let guard_interval = if md_interleave {
            if md_start {
                block_size - DIF_SIZE
            } else {
                block_size - md_size
            }
        } else {
            block_size
        };

        Ok(Self {
            block_size,
            md_size,
            md_interleave,
            md_start,
            dif_type,
            dif_flags,
            init_ref_tag,
            apptag_mask,
            app_tag,
            guard_interval,
        })
    }

    /// Whether protection information is active.
    pub fn enabled(&self) -> bool {
        self.dif_type != DifType::Disable
    }

    /// Bytes of each block covered by the guard CRC.
    pub fn guard_interval(&self) -> usize {
        self.guard_interval
    }

    /// Bytes of user data per block.
    pub fn data_block_size(&self) -> usize {
        if self.md_interleave {
            self.block_size - self.md_size
        } else {
            self.block_size
        }
    }

    /// The reference tag expected for block `index`.
    ///
    /// Types 1 and 2 increment per block; type 3 keeps the initial value.
    pub fn ref_tag_for(&self, index: usize) -> u32 {
        match self.dif_type {
            DifType::Type3 => self.init_ref_tag,
            _ => self.init_ref_tag.wrapping_add(index as u32),
        }
    }

    /// Extended length of a payload of `data_len` raw bytes once metadata
    /// is interleaved.
    pub fn length_with_md(&self, data_len: usize) -> usize {
        if !self.md_interleave {
            return data_len;
        }
        let data_block = self.data_block_size();
        let blocks = data_len / data_block;
        let remainder = data_len % data_block;
        blocks * self.block_size + remainder
    }
}

/// Write the flagged tuple fields into `tuple`, leaving unflagged bytes.
fn generate_tuple(tuple: &mut [u8], ctx: &DifCtx, guard: u16, ref_tag: u32) {
    if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
        tuple[0..2].copy_from_slice(&guard.to_be_bytes());
    }
    if ctx.dif_flags.contains(DifFlags::APPTAG_CHECK) {
        tuple[2..4].copy_from_slice(&ctx.app_tag.to_be_bytes());
    }
    if ctx.dif_flags.contains(DifFlags::REFTAG_CHECK) {
        tuple[4..8].copy_from_slice(&ref_tag.to_be_bytes());
    }
}

/// Verify one assembled tuple against the recomputed guard and the
/// expected tags. `block` is the block index reported on mismatch.
fn verify_tuple(
    tuple: &[u8],
    ctx: &DifCtx,
    guard: u16,
    ref_tag: u32,
    block: usize,
) -> std::result::Result<(), DifError> {
    let disk_app_tag = u16::from_be_bytes([tuple[2], tuple[3]]);
    let disk_ref_tag = u32::from_be_bytes([tuple[4], tuple[5], tuple[6], tuple[7]]);

    match ctx.dif_type {
        DifType::Type1 | DifType::Type2 => {
            // All checks are disabled for the block when the application
            // tag reads all ones.
            if disk_app_tag == 0xFFFF {
                return Ok(());
            }
        }
        DifType::Type3 => {
            if disk_app_tag == 0xFFFF && disk_ref_tag == 0xFFFF_FFFF {
                return Ok(());
            }
        }
        DifType::Disable => return Ok(()),
    }

    if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
        let disk_guard = u16::from_be_bytes([tuple[0], tuple[1]]);
        if disk_guard != guard {
            return Err(DifError {
                err_type: DifErrorType::Guard,
                expected: disk_guard as u32,
                actual: guard as u32,
                err_offset: block as u32,
            });
        }
    }

    if ctx.dif_flags.contains(DifFlags::APPTAG_CHECK)
        && (disk_app_tag & ctx.apptag_mask) != ctx.app_tag
    {
        return Err(DifError {
            err_type: DifErrorType::AppTag,
            expected: ctx.app_tag as u32,
            actual: (disk_app_tag & ctx.apptag_mask) as u32,
            err_offset: block as u32,
        });
    }

    if ctx.dif_flags.contains(DifFlags::REFTAG_CHECK) {
        match ctx.dif_type {
            DifType::Type1 | DifType::Type2 => {
                if disk_ref_tag != ref_tag {
                    return Err(DifError {
                        err_type: DifErrorType::RefTag,
                        expected: ref_tag,
                        actual: disk_ref_tag,
                        err_offset: block as u32,
                    });
                }
            }
            // The reference tag is opaque for type 3.
            DifType::Type3 | DifType::Disable => {}
        }
    }

    Ok(())
}

fn check_interleaved(ctx: &DifCtx) -> Result<()> {
    if !ctx.md_interleave {
        return Err(Error::invalid(
            "interleaved operation requires an extended-LBA context",
        ));
    }
    if !ctx.enabled() {
        return Err(Error::invalid("protection information is disabled"));
    }
    Ok(())
}

/// Generate protection tuples over an extended-LBA payload in place.
pub fn generate(iovs: &[SgEntry], num_blocks: usize, ctx: &DifCtx) -> Result<()> {
    check_interleaved(ctx)?;
    if sg::total_len(iovs) < num_blocks * ctx.block_size {
        return Err(Error::range("payload shorter than the requested blocks"));
    }

    if sg::has_granularity(iovs, ctx.block_size) {
        generate_whole(iovs, num_blocks, ctx);
    } else {
        generate_split(iovs, num_blocks, ctx);
    }
    Ok(())
}

fn generate_whole(iovs: &[SgEntry], num_blocks: usize, ctx: &DifCtx) {
    let mut block = 0;
    'outer: for iov in iovs {
        let mut off = 0;
        while off + ctx.block_size <= iov.len() {
            if block >= num_blocks {
                break 'outer;
            }
            let ref_tag = ctx.ref_tag_for(block);
            iov.with_mut(off, ctx.block_size, |bytes| {
                let guard = if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
                    crc16_t10dif(0, &bytes[..ctx.guard_interval])
                } else {
                    0
                };
                let (_, tail) = bytes.split_at_mut(ctx.guard_interval);
                generate_tuple(&mut tail[..DIF_SIZE], ctx, guard, ref_tag);
            });
            off += ctx.block_size;
            block += 1;
        }
    }
}

fn generate_split(iovs: &[SgEntry], num_blocks: usize, ctx: &DifCtx) {
    let mut contig = vec![0u8; ctx.guard_interval];
    let mut tuple = [0u8; DIF_SIZE];
    let total = num_blocks * ctx.block_size;
    let mut payload_offset = 0usize;

    'outer: for iov in iovs {
        let mut iov_off = 0usize;
        while iov_off < iov.len() {
            if payload_offset >= total {
                break 'outer;
            }
            let block = payload_offset / ctx.block_size;
            let offset_in_block = payload_offset % ctx.block_size;
            let avail = iov.len() - iov_off;
            let take;

            if offset_in_block < ctx.guard_interval {
                // Stage the split block data to compute the CRC over a
                // contiguous buffer.
                take = (ctx.guard_interval - offset_in_block).min(avail);
                if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
                    iov.read_at(iov_off, &mut contig[offset_in_block..offset_in_block + take]);
                }
                if offset_in_block + take == ctx.guard_interval {
                    let guard = if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
                        crc16_t10dif(0, &contig)
                    } else {
                        0
                    };
                    generate_tuple(&mut tuple, ctx, guard, ctx.ref_tag_for(block));
                }
            } else if offset_in_block < ctx.guard_interval + DIF_SIZE {
                // Copy the staged tuple into the split tuple field.
                let tuple_off = offset_in_block - ctx.guard_interval;
                take = (DIF_SIZE - tuple_off).min(avail);
                iov.write_at(iov_off, &tuple[tuple_off..tuple_off + take]);
            } else {
                // Skip metadata past the tuple when md_size > 8.
                take = (ctx.block_size - offset_in_block).min(avail);
            }

            payload_offset += take;
            iov_off += take;
        }
    }
}

/// Verify protection tuples over an extended-LBA payload.
///
/// Returns the first failing block on mismatch; the payload is unchanged.
pub fn verify(
    iovs: &[SgEntry],
    num_blocks: usize,
    ctx: &DifCtx,
) -> std::result::Result<(), DifError> {
    if check_interleaved(ctx).is_err() {
        return Ok(());
    }

    if sg::has_granularity(iovs, ctx.block_size) {
        verify_whole(iovs, num_blocks, ctx)
    } else {
        verify_split(iovs, num_blocks, ctx)
    }
}

fn verify_whole(
    iovs: &[SgEntry],
    num_blocks: usize,
    ctx: &DifCtx,
) -> std::result::Result<(), DifError> {
    let mut block = 0;
    for iov in iovs {
        let mut off = 0;
        while off + ctx.block_size <= iov.len() {
            if block >= num_blocks {
                return Ok(());
            }
            let ref_tag = ctx.ref_tag_for(block);
            let rc = iov.with(off, ctx.block_size, |bytes| {
                let guard = if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
                    crc16_t10dif(0, &bytes[..ctx.guard_interval])
                } else {
                    0
                };
                verify_tuple(
                    &bytes[ctx.guard_interval..ctx.guard_interval + DIF_SIZE],
                    ctx,
                    guard,
                    ref_tag,
                    block,
                )
            });
            rc?;
            off += ctx.block_size;
            block += 1;
        }
    }
    Ok(())
}

fn verify_split(
    iovs: &[SgEntry],
    num_blocks: usize,
    ctx: &DifCtx,
) -> std::result::Result<(), DifError> {
    let mut contig = vec![0u8; ctx.guard_interval];
    let mut tuple = [0u8; DIF_SIZE];
    let total = num_blocks * ctx.block_size;
    let mut payload_offset = 0usize;

    for iov in iovs {
        let mut iov_off = 0usize;
        while iov_off < iov.len() {
            if payload_offset >= total {
                return Ok(());
            }
            let block = payload_offset / ctx.block_size;
            let offset_in_block = payload_offset % ctx.block_size;
            let avail = iov.len() - iov_off;
            let take;

            if offset_in_block < ctx.guard_interval {
                take = (ctx.guard_interval - offset_in_block).min(avail);
                if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
                    iov.read_at(iov_off, &mut contig[offset_in_block..offset_in_block + take]);
                }
            } else if offset_in_block < ctx.guard_interval + DIF_SIZE {
                let tuple_off = offset_in_block - ctx.guard_interval;
                take = (DIF_SIZE - tuple_off).min(avail);
                iov.read_at(iov_off, &mut tuple[tuple_off..tuple_off + take]);
                if tuple_off + take == DIF_SIZE {
                    let guard = if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
                        crc16_t10dif(0, &contig)
                    } else {
                        0
                    };
                    verify_tuple(&tuple, ctx, guard, ctx.ref_tag_for(block), block)?;
                }
            } else {
                take = (ctx.block_size - offset_in_block).min(avail);
            }

            payload_offset += take;
            iov_off += take;
        }
    }
    Ok(())
}

/// Copy raw data from `iovs` into the extended-LBA `bounce` buffer while
/// generating protection tuples into it.
pub fn generate_copy(
    iovs: &[SgEntry],
    bounce: &SgEntry,
    num_blocks: usize,
    ctx: &DifCtx,
) -> Result<()> {
    check_interleaved(ctx)?;
    let data_block = ctx.data_block_size();
    if sg::total_len(iovs) < num_blocks * data_block {
        return Err(Error::range("data buffers shorter than requested blocks"));
    }
    if bounce.len() < num_blocks * ctx.block_size {
        return Err(Error::range("bounce buffer shorter than extended payload"));
    }

    if iovs.is_empty() {
        return Err(Error::invalid("empty scatter/gather list"));
    }

    let mut cursor = SgCursor::new(iovs);
    let mut data = vec![0u8; data_block];
    for block in 0..num_blocks {
        cursor.read(&mut data);
        let base = block * ctx.block_size;
        bounce.write_at(base, &data);

        let guard = if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
            bounce.with(base, ctx.guard_interval, |bytes| crc16_t10dif(0, bytes))
        } else {
            0
        };
        let mut tuple = [0u8; DIF_SIZE];
        bounce.read_at(base + ctx.guard_interval, &mut tuple);
        generate_tuple(&mut tuple, ctx, guard, ctx.ref_tag_for(block));
        bounce.write_at(base + ctx.guard_interval, &tuple);
    }
    Ok(())
}

/// Verify protection tuples in the extended-LBA `bounce` buffer, then copy
/// the raw data portions out into `iovs`.
pub fn verify_copy(
    iovs: &[SgEntry],
    bounce: &SgEntry,
    num_blocks: usize,
    ctx: &DifCtx,
) -> std::result::Result<(), DifError> {
    if check_interleaved(ctx).is_err() {
        return Ok(());
    }
    let data_block = ctx.data_block_size();

    let mut tuple = [0u8; DIF_SIZE];
    for block in 0..num_blocks {
        let base = block * ctx.block_size;
        let guard = if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
            bounce.with(base, ctx.guard_interval, |bytes| crc16_t10dif(0, bytes))
        } else {
            0
        };
        bounce.read_at(base + ctx.guard_interval, &mut tuple);
        verify_tuple(&tuple, ctx, guard, ctx.ref_tag_for(block), block)?;
    }

    let mut cursor = SgCursor::new(iovs);
    let mut data = vec![0u8; data_block];
    for block in 0..num_blocks {
        bounce.read_at(block * ctx.block_size, &mut data);
        cursor.write(&data);
    }
    Ok(())
}

fn dix_guard(ctx: &DifCtx, data: &[u8], md_slot: &[u8]) -> u16 {
    let mut guard = crc16_t10dif(0, data);
    if ctx.md_start && ctx.md_size > DIF_SIZE {
        // Metadata preceding the trailing tuple is covered as well.
        guard = crc16_t10dif(guard, &md_slot[..ctx.md_size - DIF_SIZE]);
    }
    guard
}

fn dix_tuple_offset(ctx: &DifCtx) -> usize {
    if ctx.md_start {
        ctx.md_size - DIF_SIZE
    } else {
        0
    }
}

/// Generate protection tuples into a separate metadata buffer (DIX).
///
/// `iovs` hold raw data blocks; `md_buf` is laid out as
/// `num_blocks × md_size` bytes.
pub fn dix_generate(
    iovs: &[SgEntry],
    md_buf: &SgEntry,
    num_blocks: usize,
    ctx: &DifCtx,
) -> Result<()> {
    if ctx.md_interleave {
        return Err(Error::invalid("separate-metadata operation on an extended-LBA context"));
    }
    if !ctx.enabled() {
        return Err(Error::invalid("protection information is disabled"));
    }
    if md_buf.len() < num_blocks * ctx.md_size {
        return Err(Error::range("metadata buffer shorter than requested blocks"));
    }
    if sg::total_len(iovs) < num_blocks * ctx.block_size {
        return Err(Error::range("data buffers shorter than requested blocks"));
    }

    let mut cursor = SgCursor::new(iovs);
    let mut data = vec![0u8; ctx.block_size];
    let mut md_slot = vec![0u8; ctx.md_size];
    for block in 0..num_blocks {
        cursor.read(&mut data);
        md_buf.read_at(block * ctx.md_size, &mut md_slot);

        let guard = if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
            dix_guard(ctx, &data, &md_slot)
        } else {
            0
        };
        let off = dix_tuple_offset(ctx);
        generate_tuple(&mut md_slot[off..off + DIF_SIZE], ctx, guard, ctx.ref_tag_for(block));
        md_buf.write_at(block * ctx.md_size, &md_slot);
    }
    Ok(())
}

/// Verify protection tuples held in a separate metadata buffer (DIX).
pub fn dix_verify(
    iovs: &[SgEntry],
    md_buf: &SgEntry,
    num_blocks: usize,
    ctx: &DifCtx,
) -> std::result::Result<(), DifError> {
    if ctx.md_interleave || !ctx.enabled() {
        return Ok(());
    }

    let mut cursor = SgCursor::new(iovs);
    let mut data = vec![0u8; ctx.block_size];
    let mut md_slot = vec![0u8; ctx.md_size];
    for block in 0..num_blocks {
        cursor.read(&mut data);
        md_buf.read_at(block * ctx.md_size, &mut md_slot);

        let guard = if ctx.dif_flags.contains(DifFlags::GUARD_CHECK) {
            dix_guard(ctx, &data, &md_slot)
        } else {
            0
        };
        let off = dix_tuple_offset(ctx);
        verify_tuple(&md_slot[off..off + DIF_SIZE], ctx, guard, ctx.ref_tag_for(block), block)?;
    }
    Ok(())
}

/// Flip one bit of an extended-LBA payload for fault injection.
///
/// The position is caller-selected: the target field of `block`, the byte
/// offset within that field, and the bit within that byte.
pub fn inject_error(
    iovs: &[SgEntry],
    num_blocks: usize,
    ctx: &DifCtx,
    target: InjectTarget,
    block: usize,
    byte: usize,
    bit: u8,
) -> Result<()> {
    check_interleaved(ctx)?;
    if block >= num_blocks || bit >= 8 {
        return Err(Error::range("injection position outside the payload"));
    }

    let (region_off, region_len) = match target {
        InjectTarget::Data => (0, ctx.guard_interval),
        InjectTarget::Guard => (ctx.guard_interval, 2),
        InjectTarget::AppTag => (ctx.guard_interval + 2, 2),
        InjectTarget::RefTag => (ctx.guard_interval + 4, 4),
    };
    if byte >= region_len {
        return Err(Error::range("injection byte outside the target field"));
    }

    let abs = block * ctx.block_size + region_off + byte;
    let mut cursor = SgCursor::new(iovs);
    cursor.advance(abs);
    let mut val = [0u8; 1];
    if cursor.read(&mut val) != 1 {
        return Err(Error::range("injection position outside the payload"));
    }
    val[0] ^= 1 << bit;
    let mut cursor = SgCursor::new(iovs);
    cursor.advance(abs);
    cursor.write(&val);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::dma::DmaBuf;

    fn ctx_type1(block_size: usize, md_size: usize) -> DifCtx {
        DifCtx::new(
            block_size,
            md_size,
            true,
            true,
            DifType::Type1,
            DifFlags::GUARD_CHECK | DifFlags::APPTAG_CHECK | DifFlags::REFTAG_CHECK,
            0x20,
            0xFFFF,
            0x1234,
        )
        .unwrap()
    }

    fn fill_pattern(iovs: &[SgEntry], seed: u8) {
        let total = sg::total_len(iovs);
        let data: Vec<u8> = (0..total).map(|i| (i as u8).wrapping_add(seed)).collect();
        let mut cursor = SgCursor::new(iovs);
        cursor.write(&data);
    }

    #[test]
    fn test_ctx_validation() {
        assert!(DifCtx::new(
            520,
            8,
            true,
            true,
            DifType::Type3,
            DifFlags::REFTAG_CHECK,
            0,
            0xFFFF,
            0
        )
        .is_err());
        assert!(DifCtx::new(
            516,
            4,
            true,
            true,
            DifType::Type1,
            DifFlags::GUARD_CHECK,
            0,
            0xFFFF,
            0
        )
        .is_err());
    }

    #[test]
    fn test_guard_interval_placement() {
        // Tuple in the last eight bytes: the guard spans everything else.
        let ctx = DifCtx::new(
            528,
            16,
            true,
            true,
            DifType::Type1,
            DifFlags::GUARD_CHECK,
            0,
            0xFFFF,
            0,
        )
        .unwrap();
        assert_eq!(ctx.guard_interval(), 520);

        // Tuple in the first eight bytes of metadata: the guard covers
        // only the data portion.
        let ctx = DifCtx::new(
            528,
            16,
            true,
            false,
            DifType::Type1,
            DifFlags::GUARD_CHECK,
            0,
            0xFFFF,
            0,
        )
        .unwrap();
        assert_eq!(ctx.guard_interval(), 512);
    }

    #[test]
    fn test_generate_verify_roundtrip_whole_blocks() {
        let ctx = ctx_type1(520, 8);
        let iovs = vec![SgEntry::whole(DmaBuf::alloc(4 * 520))];
        fill_pattern(&iovs, 7);

        generate(&iovs, 4, &ctx).unwrap();
        verify(&iovs, 4, &ctx).unwrap();
    }

    #[test]
    fn test_generate_verify_roundtrip_split_blocks() {
        let ctx = ctx_type1(520, 8);
        // Regions deliberately misaligned with the block size; tuples and
        // data straddle region boundaries.
        let lens = [100, 517, 523, 300, 640];
        assert_eq!(lens.iter().sum::<usize>(), 4 * 520);
        let iovs: Vec<SgEntry> = lens
            .iter()
            .map(|&l| SgEntry::whole(DmaBuf::alloc(l)))
            .collect();
        fill_pattern(&iovs, 3);

        generate(&iovs, 4, &ctx).unwrap();
        verify(&iovs, 4, &ctx).unwrap();

        // The same payload gathered into one contiguous region verifies
        // identically: the split path produced the same bytes.
        let flat = SgEntry::whole(DmaBuf::alloc(4 * 520));
        let mut all = vec![0u8; 4 * 520];
        let mut cursor = SgCursor::new(&iovs);
        cursor.read(&mut all);
        flat.write_at(0, &all);
        verify(std::slice::from_ref(&flat), 4, &ctx).unwrap();
    }

    #[test]
    fn test_verify_detects_each_field() {
        for (target, err_type) in [
            (InjectTarget::Guard, DifErrorType::Guard),
            (InjectTarget::AppTag, DifErrorType::AppTag),
            (InjectTarget::RefTag, DifErrorType::RefTag),
        ] {
            let ctx = ctx_type1(520, 8);
            let iovs = vec![SgEntry::whole(DmaBuf::alloc(3 * 520))];
            fill_pattern(&iovs, 11);
            generate(&iovs, 3, &ctx).unwrap();

            inject_error(&iovs, 3, &ctx, target, 1, 0, 2).unwrap();
            let err = verify(&iovs, 3, &ctx).unwrap_err();
            assert_eq!(err.err_type, err_type);
            assert_eq!(err.err_offset, 1);
        }
    }

    #[test]
    fn test_data_corruption_fails_guard() {
        let ctx = ctx_type1(520, 8);
        let iovs = vec![SgEntry::whole(DmaBuf::alloc(2 * 520))];
        fill_pattern(&iovs, 1);
        generate(&iovs, 2, &ctx).unwrap();

        inject_error(&iovs, 2, &ctx, InjectTarget::Data, 0, 100, 0).unwrap();
        let err = verify(&iovs, 2, &ctx).unwrap_err();
        assert_eq!(err.err_type, DifErrorType::Guard);
        assert_eq!(err.err_offset, 0);
    }

    #[test]
    fn test_apptag_ffff_skips_checks_type1() {
        let ctx = ctx_type1(520, 8);
        let iovs = vec![SgEntry::whole(DmaBuf::alloc(520))];
        fill_pattern(&iovs, 9);
        // Garbage tuple, but an all-ones application tag disables every
        // check for the block.
        iovs[0].write_at(512, &[0xDE, 0xAD, 0xFF, 0xFF, 0xBE, 0xEF, 0x00, 0x01]);
        verify(&iovs, 1, &ctx).unwrap();
    }

    #[test]
    fn test_type3_skip_needs_both_tags() {
        let ctx = DifCtx::new(
            520,
            8,
            true,
            true,
            DifType::Type3,
            DifFlags::GUARD_CHECK | DifFlags::APPTAG_CHECK,
            0,
            0xFFFF,
            0xFFFF,
        )
        .unwrap();
        let iovs = vec![SgEntry::whole(DmaBuf::alloc(520))];
        fill_pattern(&iovs, 5);

        // app_tag all ones but ref tag not: checks still run and the bogus
        // guard is caught.
        iovs[0].write_at(512, &[0, 0, 0xFF, 0xFF, 0, 0, 0, 1]);
        let err = verify(&iovs, 1, &ctx).unwrap_err();
        assert_eq!(err.err_type, DifErrorType::Guard);

        // Both all ones: the block is skipped.
        iovs[0].write_at(512, &[0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        verify(&iovs, 1, &ctx).unwrap();
    }

    #[test]
    fn test_masked_apptag_compare() {
        let ctx = DifCtx::new(
            520,
            8,
            true,
            true,
            DifType::Type1,
            DifFlags::APPTAG_CHECK,
            0,
            0x00F0,
            0x0030,
        )
        .unwrap();
        let iovs = vec![SgEntry::whole(DmaBuf::alloc(520))];
        // On-disk tag 0x1234: masked with 0x00F0 gives 0x0030.
        iovs[0].write_at(512, &[0, 0, 0x12, 0x34, 0, 0, 0, 0]);
        verify(&iovs, 1, &ctx).unwrap();

        iovs[0].write_at(512, &[0, 0, 0x12, 0x44, 0, 0, 0, 0]);
        let err = verify(&iovs, 1, &ctx).unwrap_err();
        assert_eq!(err.err_type, DifErrorType::AppTag);
    }

    #[test]
    fn test_ref_tag_increments_per_block() {
        let ctx = ctx_type1(520, 8);
        let iovs = vec![SgEntry::whole(DmaBuf::alloc(3 * 520))];
        generate(&iovs, 3, &ctx).unwrap();
        for block in 0..3 {
            let mut tuple = [0u8; 8];
            iovs[0].read_at(block * 520 + 512, &mut tuple);
            let ref_tag = u32::from_be_bytes([tuple[4], tuple[5], tuple[6], tuple[7]]);
            assert_eq!(ref_tag, 0x20 + block as u32);
        }
    }

    #[test]
    fn test_generate_copy_verify_copy() {
        let ctx = ctx_type1(520, 8);
        let data_iovs = vec![
            SgEntry::whole(DmaBuf::alloc(512)),
            SgEntry::whole(DmaBuf::alloc(512)),
        ];
        fill_pattern(&data_iovs, 42);
        let bounce = SgEntry::whole(DmaBuf::alloc(2 * 520));

        generate_copy(&data_iovs, &bounce, 2, &ctx).unwrap();
        verify(std::slice::from_ref(&bounce), 2, &ctx).unwrap();

        // Round trip back into fresh data buffers.
        let out_iovs = vec![SgEntry::whole(DmaBuf::alloc(1024))];
        verify_copy(&out_iovs, &bounce, 2, &ctx).unwrap();
        let mut a = vec![0u8; 1024];
        let mut b = vec![0u8; 1024];
        SgCursor::new(&data_iovs).read(&mut a);
        SgCursor::new(&out_iovs).read(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_dix_generate_verify() {
        let ctx = DifCtx::new(
            512,
            8,
            false,
            true,
            DifType::Type1,
            DifFlags::GUARD_CHECK | DifFlags::REFTAG_CHECK,
            0,
            0xFFFF,
            0,
        )
        .unwrap();
        let iovs = vec![SgEntry::whole(DmaBuf::alloc(2 * 512))];
        fill_pattern(&iovs, 17);
        let md = SgEntry::whole(DmaBuf::alloc(2 * 8));

        dix_generate(&iovs, &md, 2, &ctx).unwrap();
        dix_verify(&iovs, &md, 2, &ctx).unwrap();

        // Reference tags land big-endian in the tail of each slot.
        let mut slot = [0u8; 8];
        md.read_at(8, &mut slot);
        assert_eq!(u32::from_be_bytes([slot[4], slot[5], slot[6], slot[7]]), 1);

        // Corrupt the second slot's reference tag.
        md.write_at(8 + 7, &[0x55]);
        let err = dix_verify(&iovs, &md, 2, &ctx).unwrap_err();
        assert_eq!(err.err_type, DifErrorType::RefTag);
        assert_eq!(err.err_offset, 1);
    }

    #[test]
    fn test_length_with_md() {
        let ctx = ctx_type1(520, 8);
        assert_eq!(ctx.length_with_md(512), 520);
        assert_eq!(ctx.length_with_md(4096), 8 * 520);
    }
}
