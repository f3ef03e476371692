//! Device targeting: acceptance filters and masks.
//!
//! A frame targets a device when its direction bit is a query and its
//! class/sub-id match either the device's own address or the broadcast
//! address. The filter/mask pairs are in the classic CAN filter form so
//! they can be handed to hardware acceptance filters directly; software
//! drivers can call [`is_target`] instead.

use crate::frame::{Direction, Id};
use crate::DeviceId;

/// Acceptance filter matching queries addressed to `did` (under [`mask`]).
pub fn filter_for(did: DeviceId) -> u16 {
    u16::from(
        Id::new()
            .with_direction(Direction::Query)
            .with_class(did.class())
            .with_sub_id(did.sub_id()),
    )
}

/// Acceptance filter matching broadcast queries (under [`mask`]).
pub fn broadcast_filter() -> u16 {
    filter_for(DeviceId::BROADCAST)
}

/// Mask selecting the direction, class and sub-id identifier fields.
pub fn mask() -> u16 {
    filter_for(DeviceId::BROADCAST)
}

/// Whether a standard-id frame with raw identifier `raw` targets `did`.
pub fn is_target(did: DeviceId, raw: u16) -> bool {
    let masked = raw & mask();
    masked == filter_for(did) || masked == broadcast_filter()
}

/// [`is_target`] over an `embedded-can` identifier. Extended-id frames
/// never target a CANIOT device.
pub fn is_target_can(did: DeviceId, id: embedded_can::Id) -> bool {
    match id {
        embedded_can::Id::Standard(id) => is_target(did, id.as_raw()),
        embedded_can::Id::Extended(_) => false,
    }
}

/// [`is_target_can`] over a whole received frame; remote frames never
/// target a CANIOT device either.
pub fn is_target_frame<F: embedded_can::Frame>(did: DeviceId, frame: &F) -> bool {
    !frame.is_remote_frame() && is_target_can(did, frame.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_covers_direction_and_address() {
        // direction bit 2, class bits 3..5, sub-id bits 6..8
        assert_eq!(mask(), 0x1FC);
    }

    #[test]
    fn extended_ids_ignored() {
        let did = DeviceId::new(1, 2).unwrap();
        let ext = embedded_can::ExtendedId::new(0x1FC).unwrap();
        assert!(!is_target_can(did, embedded_can::Id::Extended(ext)));
        let std = embedded_can::StandardId::new(filter_for(did)).unwrap();
        assert!(is_target_can(did, embedded_can::Id::Standard(std)));
    }
}
