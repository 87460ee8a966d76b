//! Calibrated line-scanning backend: device sessions, calibration, line
//! reordering, shading and a reader task streaming the page to the client.

mod backend;
mod device;
mod parameters;
mod result;
mod scanner;
mod utils;

pub mod calibration;
pub mod geometry;
pub mod hardware;
pub mod options;
pub mod packing;
pub mod profile;
pub mod protocol;
pub mod reader;
pub mod reorder;
pub mod shading;
pub mod sim;
pub mod store;
pub mod stream;
pub mod transport;

pub use backend::Backend;
pub use device::Device;
pub use options::{
    Capabilities as OptionCapabilities, Constraint as OptionConstraint, Info as OptionInfo,
    OptionId, ScannerOption, Type as OptionType, Unit as OptionUnit, Value as OptionValue,
};
pub use parameters::{FrameFormat, Parameters};
pub use result::{Result, SaneError};
pub use scanner::{PageReader, Scanner};
pub use stream::Scheduler;
pub use utils::{mm_to_pixels, Channel, Fixed, MM_PER_INCH};
