//! Attribute key parsing and resolution against the catalogue.
//!
//! A 16-bit key names a 4-byte window of one attribute:
//!
//! ```norust
//!  4    | 8               | 4
//! part  | attribute index | section index
//! ```
//!
//! (least-significant field first; the part index selects which 4-byte
//! window of an attribute larger than 4 bytes is addressed).

use crate::schema::{self, ClassRestriction, RoleFlags, SectionId, SectionRole};
use crate::Error;
use modular_bitfield::prelude::*;

/// Packed attribute key.
#[bitfield]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub part: B4,
    pub index: B8,
    pub section: B4,
}

impl Key {
    pub fn from_raw(raw: u16) -> Key {
        Key::from_bytes(raw.to_le_bytes())
    }

    pub fn raw(self) -> u16 {
        u16::from_le_bytes(self.into_bytes())
    }

    pub fn from_parts(section: u8, index: u8, part: u8) -> Key {
        Key::new()
            .with_section(section)
            .with_index(index)
            .with_part(part)
    }
}

/// Access descriptor produced by [`resolve`]: where the addressed window
/// lives and what may be done with it.
///
/// `flags` are already adjusted for the section role (a read-only section
/// strips `WRITABLE`) and for hidden attributes (which lose both rights).
#[derive(Debug, Clone, Copy)]
pub struct Access {
    pub key: u16,
    pub section: SectionId,
    /// Final byte offset inside the section store (attribute offset plus
    /// the part window).
    pub offset: usize,
    /// Window size in bytes, at most 4.
    pub size: usize,
    pub flags: RoleFlags,
    pub class: ClassRestriction,
    /// Whether writes must be surfaced to the application for
    /// persistence.
    pub persistent: bool,
}

/// Resolves a raw key into an [`Access`] descriptor.
pub fn resolve(raw: u16) -> Result<Access, Error> {
    let key = Key::from_raw(raw);
    let section_id = SectionId::from_index(key.section()).ok_or(Error::KeySection)?;
    let section = section_id.spec();
    let spec = section
        .attributes
        .get(usize::from(key.index()))
        .ok_or(Error::KeyAttribute)?;
    let part = usize::from(key.part());
    if part * 4 >= spec.size {
        return Err(Error::KeyPart);
    }

    let mut flags = spec.flags;
    if section.role == SectionRole::ReadOnly {
        flags.remove(RoleFlags::WRITABLE);
    }
    if flags.contains(RoleFlags::HIDDEN) {
        flags.remove(RoleFlags::READABLE.union(RoleFlags::WRITABLE));
    }

    Ok(Access {
        key: raw,
        section: section_id,
        offset: spec.offset + part * 4,
        size: (spec.size - part * 4).min(4),
        flags,
        class: spec.class,
        persistent: section.role == SectionRole::Persistent,
    })
}

/// Iterates the whole catalogue in key order, hidden entries included.
/// Yields the part-0 key of each attribute.
pub fn attributes() -> impl Iterator<Item = (Key, &'static schema::AttrSpec)> {
    schema::SECTIONS
        .iter()
        .enumerate()
        .flat_map(|(section, spec)| {
            spec.attributes
                .iter()
                .enumerate()
                .map(move |(index, attr)| (Key::from_parts(section as u8, index as u8, 0), attr))
        })
}
