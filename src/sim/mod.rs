//! Simulation scaffolding: virtual clock, event scheduler, device model
//! and the driver that moves frames between nodes

mod clock;
mod device;
mod scheduler;
mod simulator;

pub use clock::Clock;
pub use device::{Device, EtherDevice, Frame, PtpDevice};
pub use scheduler::{EventToken, Scheduler};
pub use simulator::{SimEvent, Simulator};
