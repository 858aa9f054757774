pub mod epdc;
pub mod sim;

pub use crate::epdc::config::{EpdcConfig, UpdateScheme};
pub use crate::epdc::driver::{Collaborators, Epdc, EngineStats, QueueSnapshot};
pub use crate::epdc::error::Error;
pub use crate::epdc::flag::{Flag, UpdateFlags};
pub use crate::epdc::interface::{Capabilities, EpdcHardware, Revision};
pub use crate::epdc::marker::Marker;
pub use crate::epdc::power::{PowerDownDelay, PowerState};
pub use crate::epdc::types::{
    AltBuffer, Rect, Rotation, TemperaturePolicy, UpdateMode, UpdateOutcome, UpdateRequest,
    WaveformMode,
};
