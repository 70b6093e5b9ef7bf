//! Replace: carve a new, differently typed IO out of registered IOs.
//!
//! A bit replacement scans the whole region of the replaced IO, a byte
//! replacement only its own span. Plain IOs found there are absorbed and
//! leave a redirect; existing replacements conflict.

use std::ops::Range;

use super::address::{DefaultSpec, DefaultValue, IoDescriptor, IoKind, StructInfo};
use super::format::StructFormat;
use super::registry::{DeadIo, IoId, IoRegistry};
use super::types::ByteOrder;
use super::{IoError, IoResult};

/// Parameters of one replace operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplaceRequest {
    /// Name of the new IO.
    pub name: String,
    /// Type code, e.g. `h`, `?`, `8s`.
    pub format: String,
    /// Bit inside the replaced region (only for `?`).
    pub bit: Option<u32>,
    /// Byte order, inherited from the replaced IO when `None`.
    pub byte_order: Option<ByteOrder>,
    /// Word order applied before the byte order.
    pub word_order: Option<ByteOrder>,
    /// Default, computed from the absorbed IOs when `None`.
    pub default: DefaultSpec,
    /// Description.
    pub bmk: String,
    /// Export flag, inherited from the replaced IO when `None`.
    pub export: Option<bool>,
}

impl ReplaceRequest {
    /// Request with name and type code; everything else inherited.
    pub fn new(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            ..Self::default()
        }
    }
}

impl IoRegistry {
    /// IO a replace of `name` is anchored on.
    ///
    /// A live name must be replaceable. A dead name yields the IO it was
    /// before being absorbed, so later replaces keep working on the old
    /// region.
    pub fn replace_anchor(&self, name: &str) -> IoResult<&IoDescriptor> {
        if let Some(io) = self.id_of_live(name).and_then(|id| self.descriptor(id)) {
            return match io.kind {
                IoKind::Replaceable => Ok(io),
                _ => Err(IoError::NotReplaceable(name.to_string())),
            };
        }
        self.dead(name)
            .map(|dead| &dead.original)
            .ok_or_else(|| IoError::UnknownIo(name.to_string()))
    }

    fn id_of_live(&self, name: &str) -> Option<IoId> {
        if self.contains(name) { self.id_of(name) } else { None }
    }

    /// Replace `parent` with a new IO described by `request`.
    ///
    /// `scope` maps the anchor to the absolute range of its device section;
    /// the new span must stay inside it.
    pub fn replace<F>(&mut self, parent: &str, request: &ReplaceRequest, scope: F) -> IoResult<IoId>
    where
        F: FnOnce(&IoDescriptor) -> Range<usize>,
    {
        let anchor = self.replace_anchor(parent)?.clone();
        if self.name_taken(&request.name) {
            return Err(IoError::DuplicateName(request.name.clone()));
        }
        let format = StructFormat::parse(&request.format)?;
        let byte_order = request.byte_order.unwrap_or(anchor.byte_order);

        let allowed = scope(&anchor);
        let mut io = build(&anchor, request, format, byte_order, allowed)?;

        // A dead name whose region now belongs to a byte replacement has no
        // free bytes left to carve.
        if let Some(dead) = self.dead(parent)
            && let Some(live) = self.descriptor(dead.replaced_by)
            && !live.is_bit()
        {
            return Err(IoError::Overlap {
                name: io.name,
                holder: live.name.clone(),
            });
        }

        let scan_range = if io.is_bit() {
            anchor.address..anchor.address + anchor.length
        } else {
            io.span()
        };
        let found = self.scan(&io, scan_range)?;

        let mut absorbed = Vec::with_capacity(found.len());
        for id in found {
            if let Some(name) = self.descriptor(id).map(|d| d.name.clone()) {
                absorbed.push(self.unregister(&name)?);
            }
        }

        if request.default == DefaultSpec::None {
            io.default = if io.is_bit() {
                DefaultValue::Bool(bit_default(&anchor, &io, byte_order))
            } else {
                DefaultValue::Bytes(concat_defaults(&absorbed, io.address, io.length, byte_order))
            };
        }

        let id = self.insert(io);
        for original in absorbed {
            self.dead.insert(
                original.name.clone(),
                DeadIo {
                    original,
                    replaced_by: id,
                },
            );
        }
        Ok(id)
    }

    /// Collect absorbable IOs in `range` and reject conflicting replacements.
    ///
    /// Bit replacements may share a byte as long as their bits differ; any
    /// other meeting with an existing replacement is an overlap.
    fn scan(&self, io: &IoDescriptor, range: Range<usize>) -> IoResult<Vec<IoId>> {
        if let Some(holder) = self
            .covering(range.start)
            .and_then(|id| self.descriptor(id))
        {
            return Err(IoError::Overlap {
                name: io.name.clone(),
                holder: holder.name.clone(),
            });
        }
        let mut absorbed = Vec::new();
        for id in self.ids_in(range) {
            let Some(old) = self.descriptor(id) else {
                continue;
            };
            if !old.is_struct() {
                absorbed.push(id);
                continue;
            }
            match (io.bit, old.bit) {
                (Some(new_bit), Some(old_bit)) => {
                    if new_bit == old_bit && io.address == old.address {
                        return Err(IoError::BitAssigned {
                            bit: new_bit,
                            holder: old.name.clone(),
                        });
                    }
                }
                _ => {
                    return Err(IoError::Overlap {
                        name: io.name.clone(),
                        holder: old.name.clone(),
                    });
                }
            }
        }
        Ok(absorbed)
    }
}

/// Descriptor of the new IO before absorption.
fn build(
    anchor: &IoDescriptor,
    request: &ReplaceRequest,
    format: StructFormat,
    byte_order: ByteOrder,
    allowed: Range<usize>,
) -> IoResult<IoDescriptor> {
    let (address, length, bit) = if format.is_bit() {
        if request.word_order.is_some() {
            return Err(IoError::WordOrderOnBit);
        }
        let bit = request.bit.unwrap_or(0);
        let max = u32::try_from(anchor.length.saturating_mul(8)).unwrap_or(u32::MAX);
        if bit >= max {
            return Err(IoError::InvalidBit {
                bit,
                max: max.saturating_sub(1),
            });
        }
        (anchor.address + (bit / 8) as usize, 0, Some((bit % 8) as u8))
    } else {
        let length = format.width();
        if request.word_order.is_some() && length % 2 != 0 {
            return Err(IoError::WordOrderOddLength(length));
        }
        (anchor.address, length, None)
    };
    let inside = address
        .checked_add(length.max(1))
        .is_some_and(|end| address >= allowed.start && end <= allowed.end);
    if !inside {
        return Err(IoError::OutOfScope(request.name.clone()));
    }

    let default = match bit {
        Some(_) => DefaultValue::Bool(request.default.to_bit()),
        None => DefaultValue::Bytes(request.default.to_bytes(&request.name, length, byte_order)?),
    };

    let mut io = IoDescriptor {
        name: request.name.clone(),
        device: anchor.device,
        device_offset: anchor.device_offset,
        direction: anchor.direction,
        address,
        length,
        bit,
        byte_order,
        signed: format.signed(),
        default,
        export: anchor.export,
        bmk: request.bmk.clone(),
        kind: IoKind::Struct(StructInfo {
            format,
            word_order: request.word_order,
            parent: anchor.name.clone(),
            parent_address: anchor.address,
            parent_length: anchor.length,
        }),
    };
    if let Some(export) = request.export {
        io.set_export(export);
    }
    Ok(io)
}

/// Default of a bit replacement: the matching bit of the anchor's default,
/// read in the new byte order.
fn bit_default(anchor: &IoDescriptor, io: &IoDescriptor, byte_order: ByteOrder) -> bool {
    let mut parent = anchor.default.bytes();
    if anchor.byte_order != byte_order {
        parent.reverse();
    }
    let index = io.address - anchor.address;
    let mask = io.bit_mask().unwrap_or(0);
    parent.get(index).is_some_and(|b| b & mask != 0)
}

/// Concatenate absorbed defaults in address order.
///
/// Little endian appends, big endian prepends. Unregistered bytes count as
/// zero, bits of one byte are merged, and anything beyond `length` is cut.
fn concat_defaults(absorbed: &[IoDescriptor], start: usize, length: usize, order: ByteOrder) -> Vec<u8> {
    let mut out = vec![0u8; length];
    for io in absorbed {
        let Some(offset) = io.address.checked_sub(start) else {
            continue;
        };
        let mut piece = match (io.bit_mask(), &io.default) {
            (Some(mask), DefaultValue::Bool(on)) => vec![if *on { mask } else { 0 }],
            _ => io.default.bytes(),
        };
        if io.byte_order != order {
            piece.reverse();
        }
        for (i, byte) in piece.into_iter().enumerate() {
            let pos = match order {
                ByteOrder::Little => Some(offset + i),
                // The piece at `offset` ends at `length - offset`.
                ByteOrder::Big => (length + i).checked_sub(offset + io.length.max(1)),
            };
            if let Some(slot) = pos.and_then(|p| out.get_mut(p)) {
                *slot |= byte;
            }
        }
    }
    out
}
