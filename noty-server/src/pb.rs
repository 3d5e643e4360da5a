//! Generated protobuf types shared by the peer transport (§4.2) and the
//! client session protocol (§4.7). Both carriers exchange the same `Payload`
//! envelope; fields irrelevant to one side stay at their default there.

include!(concat!(env!("OUT_DIR"), "/noty.payload.rs"));
