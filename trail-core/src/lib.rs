//! Trail-talk link protocol.
//! Pure and clock-free: the host owns sockets, timers and audio devices and
//! passes bytes and timestamps in.

pub mod activity;
pub mod device;
pub mod frame;
pub mod geo;
pub mod link;
pub mod location;
pub mod protocol;
pub mod wire;

pub use activity::{TalkState, TransmissionMonitor, DEFAULT_SILENCE_THRESHOLD};
pub use device::{AddressParseError, Device, DeviceAddress, DiscoveredDevices};
pub use frame::{encode_location_record, AudioChunk, Demuxed, FrameCodec, FrameError};
pub use link::{LinkActivity, LinkState};
pub use location::{Coordinate, LocationError};
pub use protocol::{Advertisement, Message, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
