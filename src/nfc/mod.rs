pub mod frame;
pub mod simulation;
mod transceiver;

pub use frame::{FrameBuilder, PayloadCipher, RxFrame, TxFrame};
pub use simulation::SimulatedTag;
pub use transceiver::Transceiver;
