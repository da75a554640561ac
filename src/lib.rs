//! Acquisition engines for two families of USB logic analyzers: the ASIX
//! SIGMA/SIGMA2 (an FPGA behind an FTDI bridge) and the Kingst
//! LA2016/LA1016 (an FPGA behind a Cypress FX2).
//!
//! The crate is the per-device core only. A host framework owns USB
//! enumeration, model dispatch, option parsing and the event loop; it hands
//! each engine a transport, a firmware loader and a trigger description,
//! ticks it through `poll`, and receives decoded samples through the
//! [`Session`] trait. See the `transport`, `firmware` and `session` modules
//! for the exact seams.

pub mod bitops;
mod error;
pub mod firmware;
pub mod la2016;
pub mod la2016_bringup;
pub mod la2016_decode;
pub mod la2016_proto;
pub mod la2016_trigger;
pub mod session;
pub mod sigma;
pub mod sigma_bringup;
pub mod sigma_decode;
pub mod sigma_proto;
pub mod sigma_trigger;
pub mod submit;
pub mod transport;
pub mod wire;

pub use error::{Error, Result};
pub use firmware::FirmwareLoader;
pub use la2016::{La2016Device, La2016Model, PwmSetting, LA1016, LA2016};
pub use session::{
    ChannelMatch, Packet, PollStatus, Session, TriggerMatch, TriggerSpec, POLL_INTERVAL,
};
pub use sigma::{FirmwareKind, SigmaDevice, SigmaModel, SIGMA};
pub use submit::SubmitBuffer;
pub use transport::{BitbangBridge, ControlTransport, Transport, DEFAULT_TIMEOUT};
